use std::process::ExitCode;

fn main() -> ExitCode {
    picam_detect::run_cli()
}
