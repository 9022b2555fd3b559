fn main() -> std::process::ExitCode {
    inferdesk_lib::run()
}
