use std::process::ExitCode;

fn main() -> ExitCode {
    rover_pilot::run_cli()
}
