use std::process::ExitCode;

fn main() -> ExitCode {
    vocario_cli::run()
}
