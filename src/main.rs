use clap::{Arg, ArgAction, ArgMatches, Command};
use futures::future::{self, Either};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fcpr::client_get::{Download, GetRequest};
use fcpr::client_put::{PutRequest, PutSource, Upload};
use fcpr::config::Config;
use fcpr::connection::{Connection, Connector};
use fcpr::keys::{self, KeyType};
use fcpr::logging::init_tracing;
use fcpr::queue::TransferQueue;
use fcpr::queue_loader::QueueLoader;
use fcpr::store::QueueStore;
use fcpr::transfer::{Transfer, TransferSnapshot};

///////////////////////
// Utility functions //
///////////////////////

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let mut config = Config::load(matches.get_one::<String>("config").map(Path::new))?;
	if let Some(host) = matches.get_one::<String>("host") {
		config.host = host.clone();
	}
	if let Some(port) = matches.get_one::<u16>("port") {
		config.port = *port;
	}
	if let Some(name) = matches.get_one::<String>("name") {
		config.client_name = name.clone();
	}
	if let Some(priority) = matches.get_one::<u8>("priority") {
		config.priority = *priority;
	}
	config.validate()?;
	Ok(config)
}

async fn connect(config: &Config, auto_download: bool) -> Result<Connection, Box<dyn Error>> {
	let mut options = config.session_options();
	options.auto_download = auto_download;
	Ok(config.connector().connect(options).await?)
}

/// Wait until the transfer is finished, or until Ctrl-C
async fn wait_finished(transfer: &dyn Transfer) -> Result<TransferSnapshot, Box<dyn Error>> {
	let mut watch = transfer.watch();
	let mut last_text = String::new();
	let finished = async move {
		loop {
			let snapshot = watch.borrow_and_update().clone();
			if snapshot.status_text != last_text {
				let progress = snapshot.network_progress().map(|p| format!(" {}%", p)).unwrap_or_default();
				eprintln!("{}{}", snapshot.status_text, progress);
				last_text = snapshot.status_text.clone();
			}
			if snapshot.status.is_finished() {
				return Ok::<_, Box<dyn Error>>(snapshot);
			}
			if watch.changed().await.is_err() {
				return Err("transfer dropped".into());
			}
		}
	};

	let outcome = future::select(Box::pin(finished), Box::pin(tokio::signal::ctrl_c())).await;
	match outcome {
		Either::Left((result, _)) => result,
		Either::Right(_) => {
			eprintln!("Interrupted, withdrawing the request");
			transfer.stop().await?;
			Err("interrupted".into())
		}
	}
}

fn parse_key_type(value: &str) -> Result<KeyType, Box<dyn Error>> {
	match value.to_ascii_lowercase().as_str() {
		"chk" => Ok(KeyType::Chk),
		"ksk" => Ok(KeyType::Ksk),
		"ssk" => Ok(KeyType::Ssk),
		"usk" => Ok(KeyType::Usk),
		other => Err(format!("unknown key type '{}'", other).into()),
	}
}

//////////////////
// Subcommands  //
//////////////////

async fn cmd_get(config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let raw = matches.get_one::<String>("key").ok_or("get: key argument required")?;
	let key = keys::clean_uri(raw).ok_or_else(|| format!("not a valid key: {}", raw))?;
	let dir = matches.get_one::<String>("dir").map(PathBuf::from).unwrap_or_else(|| config.download_dir.clone());
	tokio::fs::create_dir_all(&dir).await?;

	let connection = connect(config, true).await?;
	let queue = TransferQueue::new(config.client_name.clone());
	let mut request = GetRequest::new(key);
	request.priority = config.priority;
	request.persistence = config.persistence;
	request.global = config.global;
	request.max_retries = config.max_retries;
	request.destination = Some(dir);

	let download = Arc::new(Download::new(&connection, queue.clone(), request).await);
	queue.add(download.clone());
	download.start().await?;

	let snapshot = wait_finished(download.as_ref()).await?;
	let path = download.lock().await.path();
	connection.disconnect().await;
	if !snapshot.status.is_successful() {
		return Err(snapshot.status_text.into());
	}
	if let Some(path) = path {
		println!("{}", path.display());
	}
	Ok(())
}

async fn cmd_put(config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let file = matches.get_one::<String>("file").ok_or("put: file argument required")?;
	let key_type = parse_key_type(matches.get_one::<String>("type").map(String::as_str).unwrap_or("chk"))?;

	let connection = connect(config, false).await?;
	let queue = TransferQueue::new(config.client_name.clone());
	let mut request = PutRequest::new(PutSource::File(PathBuf::from(file)), key_type);
	request.name = matches.get_one::<String>("keyname").cloned();
	request.revision = matches.get_one::<i64>("revision").copied().unwrap_or(-1);
	request.private_key = matches.get_one::<String>("private").cloned();
	request.get_chk_only = matches.get_flag("chk-only");
	request.priority = config.priority;
	request.persistence = config.persistence;
	request.global = config.global;
	request.compress = config.compress;
	request.codec = config.codec.clone();

	let upload = Arc::new(Upload::new(&connection, queue.clone(), request).await);
	queue.add(upload.clone());
	upload.start().await?;

	let snapshot = wait_finished(upload.as_ref()).await?;
	connection.disconnect().await;
	if !snapshot.status.is_successful() {
		return Err(snapshot.status_text.into());
	}
	println!("{}", snapshot.key.unwrap_or_default());
	Ok(())
}

async fn cmd_list(config: &Config) -> Result<(), Box<dyn Error>> {
	let connection = connect(config, false).await?;
	let queue = TransferQueue::new(config.client_name.clone());
	let loader = QueueLoader::attach(&connection, queue.clone());
	loader.request().await?;
	queue.wait_loaded().await;

	for transfer in queue.transfers() {
		let s = transfer.snapshot();
		println!(
			"{:<8} {:<24} {:<10} {:>4} {}",
			format!("{:?}", s.kind).to_lowercase(),
			s.identifier.as_deref().unwrap_or(""),
			s.status.to_string(),
			s.network_progress().map(|p| format!("{}%", p)).unwrap_or_else(|| "-".to_string()),
			s.key.or(s.filename).unwrap_or_default(),
		);
	}

	let store = QueueStore::open(&config.queue_path())?;
	queue.save(&store).await?;
	connection.disconnect().await;
	Ok(())
}

fn cmd_key(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let raw = matches.get_one::<String>("key").ok_or("key: key argument required")?;
	let key = keys::clean_uri(raw).ok_or_else(|| format!("not a valid key: {}", raw))?;
	let key_type = KeyType::of(&key).ok_or("unknown key type")?;

	println!("key:        {}", key);
	println!("type:       {}", key_type);
	println!("filename:   {}", keys::filename_from_key(&key).unwrap_or_default());
	println!("obsolete:   {}", keys::is_obsolete(&key));
	match key_type {
		KeyType::Usk => {
			println!("revision:   {}", keys::usk_revision(&key));
			println!("as SSK:     {}", keys::convert_usk_to_ssk(&key));
		}
		KeyType::Ssk => println!("as USK:     {}", keys::convert_ssk_to_usk(&key)),
		KeyType::Chk | KeyType::Ksk => {}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("fcpr")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Fetch and insert files through an FCP node")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Configuration file"))
		.arg(Arg::new("host").long("host").value_name("HOST").help("Node host"))
		.arg(
			Arg::new("port")
				.long("port")
				.value_name("PORT")
				.value_parser(clap::value_parser!(u16))
				.help("Node FCP port"),
		)
		.arg(Arg::new("name").long("name").value_name("NAME").help("Client name"))
		.arg(
			Arg::new("priority")
				.short('p')
				.long("priority")
				.value_name("CLASS")
				.value_parser(clap::value_parser!(u8).range(0..=6))
				.help("Priority class (0 most urgent)"),
		)
		.subcommand(
			Command::new("get")
				.about("Download a key")
				.arg(Arg::new("key").required(true))
				.arg(Arg::new("dir").short('d').long("dir").value_name("DIR").help("Destination directory")),
		)
		.subcommand(
			Command::new("put")
				.about("Insert a file")
				.arg(Arg::new("file").required(true))
				.arg(Arg::new("type").short('t').long("type").value_name("chk|ksk|ssk|usk"))
				.arg(Arg::new("keyname").short('n').long("key-name").value_name("NAME"))
				.arg(
					Arg::new("revision")
						.short('r')
						.long("revision")
						.value_parser(clap::value_parser!(i64)),
				)
				.arg(Arg::new("private").long("private-key").value_name("KEY"))
				.arg(
					Arg::new("chk-only")
						.long("chk-only")
						.action(ArgAction::SetTrue)
						.help("Only compute the CHK"),
				),
		)
		.subcommand(Command::new("list").about("List the node's persistent requests"))
		.subcommand(Command::new("key").about("Inspect a key").arg(Arg::new("key").required(true)))
		.get_matches();

	if let Some(sub_matches) = matches.subcommand_matches("key") {
		return cmd_key(sub_matches);
	}

	let config = load_config(&matches)?;
	init_tracing(&config.log_level);

	if let Some(sub_matches) = matches.subcommand_matches("get") {
		cmd_get(&config, sub_matches).await?;
	} else if let Some(sub_matches) = matches.subcommand_matches("put") {
		cmd_put(&config, sub_matches).await?;
	} else if matches.subcommand_matches("list").is_some() {
		cmd_list(&config).await?;
	}

	Ok(())
}

// vim: ts=4
