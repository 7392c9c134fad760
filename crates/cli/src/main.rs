use std::process::ExitCode;

fn main() -> ExitCode {
    kcart_cli::run()
}
