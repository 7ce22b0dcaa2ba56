use anyhow::Result;
use clap::Parser;
use relay_listener::Address;
use relay_listener::config::Config;
use relay_listener::context::{AcceptFuture, ListenerContext, RequestFuture};
use relay_listener::listener::Listener;
use relay_listener::sas::SharedAccessKeyTokenProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// JSON config file; CLI flags below override whatever it sets.
	#[arg(long, value_name = "path")]
	config: Option<std::path::PathBuf>,

	/// Full relay connection string (`Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`).
	#[arg(long, value_name = "connection-string")]
	connection_string: Option<String>,

	/// Listener address, used together with --key-name/--key when
	/// --connection-string is not given.
	#[arg(long, value_name = "sb://namespace/path")]
	address: Option<String>,

	#[arg(long)]
	key_name: Option<String>,

	#[arg(long)]
	key: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
	relay_listener::logging::init();
	let args = Args::parse();

	let config = args
		.config
		.as_deref()
		.map(|path| -> Result<Config> {
			let text = std::fs::read_to_string(path)?;
			Ok(serde_json::from_str(&text)?)
		})
		.transpose()?;

	let connection_string = args.connection_string.or_else(|| config.as_ref().and_then(|c| c.connection_string.clone()));
	let address = args.address.or_else(|| config.as_ref().and_then(|c| c.address.clone()));
	let key_name = args.key_name.or_else(|| config.as_ref().and_then(|c| c.shared_access_key_name.clone()));
	let key = args.key.or_else(|| config.as_ref().and_then(|c| c.shared_access_key.clone()));
	let open_timeout = config.as_ref().map(Config::open_timeout).unwrap_or(Duration::from_secs(30));

	let listener = match connection_string {
		Some(cs) => Listener::from_connection_string(&cs)?,
		None => {
			let address = Address::try_from(address.ok_or_else(|| anyhow::anyhow!("either --connection-string or --address is required"))?)?;
			let provider = Arc::new(SharedAccessKeyTokenProvider::new(
				key_name.unwrap_or_default(),
				key.unwrap_or_default().into_bytes(),
				Duration::from_secs(3600),
			));
			Listener::new(address, provider)
		},
	};

	listener.on_online(|| info!("control channel online"));
	listener.on_offline(|err| match err {
		Some(e) => error!(error = %e, "control channel offline"),
		None => info!("control channel closed"),
	});
	listener.on_connecting(|err| warn!(error = %err, "control channel reconnecting"));

	listener.set_accept_handler(Arc::new(|ctx: ListenerContext| -> AcceptFuture {
		Box::pin(async move {
			info!(tracking_id = ctx.tracking.tracking_id(), "accepting inbound connection");
			Ok(true)
		})
	}));

	listener.set_request_handler(Arc::new(|ctx: ListenerContext| -> RequestFuture {
		Box::pin(async move {
			ctx.set_response(200, "OK");
			Ok(())
		})
	}));

	listener.open_with_timeout(open_timeout).await?;
	info!(address = %listener.address(), "listener open, waiting for connections");

	while let Some(mut channel) = listener.accept_connection(None).await? {
		tokio::spawn(async move {
			if let Ok(Some(data)) = channel.read_binary().await {
				let _ = channel.write_binary(&data).await;
			}
			let _ = channel.close().await;
		});
	}

	if config.as_ref().is_some_and(|c| c.metrics_enabled) {
		info!(metrics = %listener.metrics().encode(), "final metrics snapshot");
	}

	listener.close().await?;
	Ok(())
}
