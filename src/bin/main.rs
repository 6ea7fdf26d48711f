use taskmill::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let config = config::load_or_default();
    let verbosity = if cli.quiet { 0 } else { cli.verbose + 1 };
    telemetry::init(verbosity, &config.logging);

    let command = cli::command_name(&cli.command);
    let span = tracing::info_span!("tm_command", command = %command);
    let _guard = span.enter();

    if let Err(err) = cli::run(cli) {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }
}
