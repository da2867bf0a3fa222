use std::process::ExitCode;

fn main() -> ExitCode {
    autotriage_cli::run()
}
