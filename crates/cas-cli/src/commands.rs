use std::fs::File;
use std::future::Future;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cas_p2p::{Peer, PeerHook, Rpc, TcpTransport, TransportResult};
use cas_store::{content_key, Store, StoreResult};
use colored::Colorize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::*;
use crate::config::NodeConfig;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = NodeConfig::load_or_default(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.storage_root = root;
    }
    let format = cli.format;

    match cli.command {
        Command::Serve(args) => cmd_serve(config, args, &format).await,
        Command::Send(args) => cmd_send(&config, args, &format).await,
        Command::Put(args) => cmd_put(&config, args, &format),
        Command::Get(args) => cmd_get(&config, args, &format),
        Command::Rm(args) => cmd_rm(&config, args, &format),
        Command::Has(args) => cmd_has(&config, args, &format),
        Command::Path(args) => cmd_path(&config, args, &format),
        Command::Stats(_) => cmd_stats(&config, &format),
    }
}

/// Logs every peer that completes the handshake.
struct LogPeers;

#[async_trait]
impl PeerHook for LogPeers {
    async fn on_peer(&self, peer: &Peer) -> TransportResult<()> {
        info!(peer = %peer, "peer connected");
        Ok(())
    }
}

/// Store a received payload under its content key.
fn store_payload(store: &Store, payload: &[u8]) -> StoreResult<(String, u64)> {
    let key = content_key(payload);
    let written = store.write(&key, payload)?;
    Ok((key, written))
}

async fn cmd_serve(mut config: NodeConfig, args: ServeArgs, format: &OutputFormat) -> anyhow::Result<()> {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(decoder) = args.decoder {
        config.decoder = decoder;
    }

    let store = Arc::new(Store::new(config.store_options()));
    let transport = TcpTransport::new(config.transport_options().with_peer_hook(LogPeers));
    transport.listen_and_accept().await?;
    let inbound = transport.consume().context("inbound channel already taken")?;
    let addr = transport
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| config.listen_addr.clone());

    if let OutputFormat::Text = format {
        println!(
            "{} Listening on {} (root: {}, decoder: {})",
            "✓".green().bold(),
            addr.bold(),
            store.root().display(),
            config.decoder.to_string().cyan()
        );
    }

    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; shutting down"),
            Err(e) => {
                warn!(error = %e, "cannot listen for interrupts; serving until killed");
                std::future::pending::<()>().await;
            }
        }
    };
    let stored = receive_loop(Arc::clone(&store), inbound, format, interrupt).await?;

    transport.close();
    info!(stored, "node stopped");
    Ok(())
}

/// Store every inbound payload under its content key until the channel
/// ends or `shutdown` resolves. Returns how many payloads were stored.
async fn receive_loop(
    store: Arc<Store>,
    mut inbound: mpsc::Receiver<Rpc>,
    format: &OutputFormat,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<u64> {
    tokio::pin!(shutdown);
    let mut stored = 0;
    loop {
        tokio::select! {
            rpc = inbound.recv() => {
                let Some(rpc) = rpc else { break };
                let from = rpc.from;
                let payload = rpc.payload;
                let size = payload.len();
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store_payload(&store, &payload)).await? {
                    Ok((key, _)) => {
                        stored += 1;
                        report_received(format, from, &key, size);
                    }
                    Err(e) => warn!(peer = %from, error = %e, "failed to store message"),
                }
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(stored)
}

fn report_received(format: &OutputFormat, from: SocketAddr, key: &str, size: usize) {
    match format {
        OutputFormat::Text => println!(
            "  {} {} bytes from {} as {}",
            "stored".green(),
            size,
            from.to_string().bold(),
            key.yellow()
        ),
        OutputFormat::Json => println!(
            "{}",
            json!({ "from": from.to_string(), "key": key, "bytes": size })
        ),
    }
}

async fn cmd_send(config: &NodeConfig, args: SendArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let decoder = args.decoder.unwrap_or(config.decoder);
    let frame = decoder.encode(args.message.as_bytes(), config.max_frame_size)?;

    let transport = TcpTransport::new(config.transport_options());
    let peer = transport
        .dial(args.addr.as_str())
        .await
        .with_context(|| format!("dialing {}", args.addr))?;
    peer.send(&frame).await?;
    transport.close();

    match format {
        OutputFormat::Text => println!(
            "{} Sent {} bytes to {}",
            "✓".green().bold(),
            args.message.len(),
            peer.remote_addr().to_string().bold()
        ),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "to": peer.remote_addr().to_string(),
                "bytes": args.message.len(),
                "key": content_key(args.message.as_bytes()),
            })
        ),
    }
    Ok(())
}

fn cmd_put(config: &NodeConfig, args: PutArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());
    let written = match &args.file {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            store.write(&args.key, file)?
        }
        None => store.write(&args.key, io::stdin().lock())?,
    };
    let path = store.object_path(&args.key)?;

    match format {
        OutputFormat::Text => println!(
            "{} Stored {} ({} bytes) at {}",
            "✓".green().bold(),
            args.key.yellow(),
            written,
            path.display()
        ),
        OutputFormat::Json => println!(
            "{}",
            json!({ "key": args.key, "bytes": written, "path": path.display().to_string() })
        ),
    }
    Ok(())
}

fn cmd_get(config: &NodeConfig, args: GetArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());

    if let Some(output) = &args.output {
        let mut reader = store.read_stream(&args.key)?;
        let mut file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
        let copied = io::copy(&mut reader, &mut file)?;
        match format {
            OutputFormat::Text => println!(
                "{} Wrote {} ({} bytes) to {}",
                "✓".green().bold(),
                args.key.yellow(),
                copied,
                output.display()
            ),
            OutputFormat::Json => println!(
                "{}",
                json!({ "key": args.key, "bytes": copied, "output": output.display().to_string() })
            ),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Text => {
            let mut reader = store.read_stream(&args.key)?;
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }
        OutputFormat::Json => {
            let data = store.read(&args.key)?;
            println!(
                "{}",
                json!({
                    "key": args.key,
                    "bytes": data.len(),
                    "content": String::from_utf8_lossy(&data),
                })
            );
        }
    }
    Ok(())
}

fn cmd_rm(config: &NodeConfig, args: KeyArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());
    let deleted = store.delete(&args.key)?;
    match format {
        OutputFormat::Text if deleted => println!("{} Deleted {}", "✓".green().bold(), args.key.yellow()),
        OutputFormat::Text => println!("Nothing stored under {}", args.key.yellow()),
        OutputFormat::Json => println!("{}", json!({ "key": args.key, "deleted": deleted })),
    }
    Ok(())
}

fn cmd_has(config: &NodeConfig, args: KeyArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());
    let exists = store.exists(&args.key);
    match format {
        OutputFormat::Text if exists => println!("{} {} is stored", "✓".green().bold(), args.key.yellow()),
        OutputFormat::Text => println!("{} {} is not stored", "✗".red().bold(), args.key.yellow()),
        OutputFormat::Json => println!("{}", json!({ "key": args.key, "exists": exists })),
    }
    Ok(())
}

fn cmd_path(config: &NodeConfig, args: KeyArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());
    let path_key = store.path_key(&args.key)?;
    let file = store.object_path(&args.key)?;
    match format {
        OutputFormat::Text => {
            println!("Key:       {}", args.key.yellow());
            println!("Path name: {}", path_key.path_name().cyan());
            println!("File name: {}", path_key.file_name());
            println!("On disk:   {}", file.display().to_string().bold());
        }
        OutputFormat::Json => println!(
            "{}",
            json!({
                "key": args.key,
                "path_name": path_key.path_name(),
                "file_name": path_key.file_name(),
                "full_path": path_key.full_path(),
                "file": file.display().to_string(),
            })
        ),
    }
    Ok(())
}

fn cmd_stats(config: &NodeConfig, format: &OutputFormat) -> anyhow::Result<()> {
    let store = Store::new(config.store_options());
    let stats = store.stats()?;
    match format {
        OutputFormat::Text => {
            println!("Root:    {}", store.root().display().to_string().bold());
            println!("Objects: {}", stats.objects.to_string().cyan());
            println!("Bytes:   {}", stats.bytes.to_string().cyan());
        }
        OutputFormat::Json => println!(
            "{}",
            json!({
                "root": store.root().display().to_string(),
                "objects": stats.objects,
                "bytes": stats.bytes,
            })
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformKind;
    use cas_p2p::{encode_frame, DecoderKind, TcpTransportOptions, MAX_FRAME_SIZE};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn config_in(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig {
            storage_root: dir.path().join("store"),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn payload_stored_under_content_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(config_in(&dir).store_options());

        let (key, written) = store_payload(&store, b"hello world").unwrap();
        assert_eq!(key, content_key(b"hello world"));
        assert_eq!(written, 11);
        assert_eq!(store.read(&key).unwrap(), b"hello world");
    }

    #[test]
    fn put_get_rm_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let input = dir.path().join("input.txt");
        std::fs::write(&input, b"some jpg bytes").unwrap();

        cmd_put(&config, PutArgs { key: "picture".into(), file: Some(input) }, &OutputFormat::Json).unwrap();
        let store = Store::new(config.store_options());
        assert!(store.exists("picture"));

        let output = dir.path().join("output.txt");
        cmd_get(&config, GetArgs { key: "picture".into(), output: Some(output.clone()) }, &OutputFormat::Text).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"some jpg bytes");

        cmd_rm(&config, KeyArgs { key: "picture".into() }, &OutputFormat::Text).unwrap();
        assert!(!store.exists("picture"));
        cmd_rm(&config, KeyArgs { key: "picture".into() }, &OutputFormat::Json).unwrap();
    }

    #[test]
    fn get_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let args = GetArgs { key: "absent".into(), output: Some(dir.path().join("out")) };
        assert!(cmd_get(&config, args, &OutputFormat::Text).is_err());
    }

    #[test]
    fn identity_transform_rejects_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            transform: TransformKind::Identity,
            ..config_in(&dir)
        };
        assert!(cmd_path(&config, KeyArgs { key: "a/b".into() }, &OutputFormat::Text).is_err());
        cmd_path(&config, KeyArgs { key: "plain".into() }, &OutputFormat::Json).unwrap();
    }

    #[test]
    fn stats_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        cmd_stats(&config_in(&dir), &OutputFormat::Json).unwrap();
    }

    #[tokio::test]
    async fn send_delivers_to_listening_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = TcpTransport::new(TcpTransportOptions::new("127.0.0.1:0"));
        node.listen_and_accept().await.unwrap();
        let mut inbound = node.consume().unwrap();
        let addr = node.local_addr().unwrap();

        let args = SendArgs {
            addr: addr.to_string(),
            message: "my big data file here!".into(),
            decoder: Some(DecoderKind::LengthPrefixed),
        };
        cmd_send(&config_in(&dir), args, &OutputFormat::Text).await.unwrap();

        let rpc = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rpc.payload, b"my big data file here!");
    }

    #[tokio::test]
    async fn send_to_closed_port_fails() {
        let dir = tempfile::tempdir().unwrap();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let args = SendArgs { addr: addr.to_string(), message: "x".into(), decoder: None };
        assert!(cmd_send(&config_in(&dir), args, &OutputFormat::Text).await.is_err());
    }

    #[tokio::test]
    async fn receive_loop_stores_inbound_until_channel_ends() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(config_in(&dir).store_options()));
        let node = TcpTransport::new(TcpTransportOptions::new("127.0.0.1:0"));
        node.listen_and_accept().await.unwrap();
        let inbound = node.consume().unwrap();
        let addr = node.local_addr().unwrap();
        let payloads = [&b"first payload"[..], b"second payload"];

        let sender = async {
            let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
            for payload in payloads {
                client.write_all(&encode_frame(payload, MAX_FRAME_SIZE).unwrap()).await.unwrap();
            }
            timeout(Duration::from_secs(5), async {
                while !payloads.iter().all(|p| store.exists(&content_key(p))) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("payloads were not stored");
            node.close();
        };
        let looping = timeout(
            Duration::from_secs(5),
            receive_loop(Arc::clone(&store), inbound, &OutputFormat::Json, std::future::pending()),
        );

        let (stored, ()) = tokio::join!(looping, sender);
        assert_eq!(stored.expect("loop did not end after close").unwrap(), 2);
        for payload in payloads {
            assert_eq!(store.read(&content_key(payload)).unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn receive_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(config_in(&dir).store_options()));
        let (_tx, inbound) = mpsc::channel::<Rpc>(1);

        let stored = timeout(
            Duration::from_secs(5),
            receive_loop(store, inbound, &OutputFormat::Text, async {}),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stored, 0);
    }
}
