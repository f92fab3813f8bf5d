fn main() -> std::process::ExitCode {
    srpmproc::run()
}
