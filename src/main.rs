mod commands;

use commands::{Commands, RootCommand, CONFIG_ERROR, SUCCESS};
use tracing::error;

fn main() {
    let opts: RootCommand = argh::from_env();

    if opts.version {
        println!("gnmic {}", gnmic::version());
        return;
    }

    let Some(sub_command) = &opts.sub_command else {
        eprintln!("no command given, see --help");
        std::process::exit(CONFIG_ERROR);
    };

    // path parsing needs no runtime or config
    if let Commands::Path(path) = sub_command {
        std::process::exit(path.run());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("build tokio runtime");

    let code = runtime.block_on(async {
        let config = match opts.load_config() {
            Ok(config) => config,
            Err(err) => {
                eprintln!("configuration error: {err}");
                return CONFIG_ERROR;
            }
        };

        if let Err(err) = gnmic::trace::init(config.debug, config.log, config.log_file.as_deref())
        {
            eprintln!("{err}");
            return CONFIG_ERROR;
        }

        match sub_command {
            Commands::Capabilities(cmd) => cmd.run(&opts, config).await,
            Commands::Get(cmd) => cmd.run(&opts, config).await,
            Commands::Set(cmd) => cmd.run(&opts, config).await,
            Commands::Subscribe(cmd) => cmd.run(&opts, config).await,
            Commands::Path(_) => SUCCESS,
        }
    });

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    if code != SUCCESS {
        error!(message = "exiting", code);
    }
    std::process::exit(code);
}
