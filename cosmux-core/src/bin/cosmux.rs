//! cosmux command line client

use cosmux_core::{CancellationToken, Client, ClientConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: cosmux <command> [args]

commands:
  upload <file_id> <path>     upload a local file
  download <file_id> <path>   download an object to a local file
  info <file_id>              print object metadata
  rm <file_id>...             delete objects
  ls [dir] [prefix]           list objects
  url <file_id> [secs]        print a presigned download URL

configuration is read from COS_HOST, COS_SECRET_ID, COS_SECRET_KEY and the
optional COS_* tuning variables";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = ClientConfig::from_env()?;
    info!("Using COS endpoint {}://{}", config.scheme(), config.host);
    let client = Client::new(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = run(&client, &cancel, command, &args[1..]).await;

    // Let scheduled aborts reach the service before exiting
    client.shutdown().await;

    if let Err(e) = result {
        error!("{} failed: {}", command, e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    client: &Client,
    cancel: &CancellationToken,
    command: &str,
    args: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    match (command, args) {
        ("upload", [file_id, path]) => {
            client.upload_from_disk(cancel, file_id, path).await?;
            info!("Uploaded {} to {}", path, file_id);
        }
        ("download", [file_id, path]) => {
            client.download_to_disk(cancel, file_id, path).await?;
        }
        ("info", [file_id]) => {
            let info = client.info(cancel, file_id).await?;
            println!("size: {}", info.size);
            println!("etag: {}", info.etag);
            println!("crc64: {}", info.crc64);
            if let Some(t) = info.upload_time {
                println!("last-modified: {}", t.to_rfc3339());
            }
            if let Some(t) = info.expire_time {
                println!("expires: {}", t.to_rfc3339());
            }
        }
        ("rm", ids) if !ids.is_empty() => {
            let failed = client.delete_many(cancel, ids).await;
            for (id, e) in &failed {
                error!("Failed to delete {}: {}", id, e);
            }
            if !failed.is_empty() {
                return Err(format!("{} of {} deletes failed", failed.len(), ids.len()).into());
            }
        }
        ("ls", rest) if rest.len() <= 2 => {
            let dir = rest.first().map(String::as_str).unwrap_or("");
            let prefix = rest.get(1).map(String::as_str).unwrap_or("");
            let mut marker = String::new();
            loop {
                let (entries, next) = client.list_files(cancel, dir, prefix, &marker, 1000).await?;
                for entry in entries {
                    println!("{:>14}  {}", entry.size, entry.file_id);
                }
                match next {
                    Some(next) => marker = next,
                    None => break,
                }
            }
        }
        ("url", [file_id, rest @ ..]) if rest.len() <= 1 => {
            let secs = match rest.first() {
                Some(s) => s.parse()?,
                None => 3600,
            };
            let url = client.get_download_url(file_id, std::time::Duration::from_secs(secs))?;
            println!("{}", url);
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
    Ok(())
}
