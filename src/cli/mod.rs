use crate::client::{ClientConfig, PeerClient};
use crate::error::{DownloadError, P2pError, Result};
use crate::tracker::ConnectionManager;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "p2p-share")]
#[command(about = "A peer-to-peer file sharing client written in Rust", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Connection Manager
    Tracker {
        /// Interface to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "9000")]
        port: u16,
    },

    /// Join a network and share files from an interactive prompt
    Peer {
        /// Connection Manager address
        #[arg(short, long)]
        tracker: String,

        /// Connection Manager port
        #[arg(short, long, default_value = "9000")]
        port: u16,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Interface the acceptor binds to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Files to share when joining
        #[arg(short, long)]
        share: Vec<PathBuf>,

        /// Seconds to wait for a tracker reply
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Tracker { host, port } => {
                let manager = ConnectionManager::bind(&format!("{}:{}", host, port)).await?;
                println!("Connection Manager listening on {}", manager.local_addr()?);
                manager.run().await?;
            }

            Commands::Peer {
                tracker,
                port,
                output,
                bind,
                share,
                timeout,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    bind_host: bind.clone(),
                    request_timeout: Duration::from_secs(*timeout),
                    ..ClientConfig::default()
                };

                let client = Arc::new(PeerClient::new(config));
                println!("Downloads are saved to {}", client.download_dir().display());
                for path in share {
                    match client.add_share_file(path).await {
                        Ok(name) => println!("Sharing {}", name),
                        Err(e) => eprintln!("Unable to share {}: {}", path.display(), e),
                    }
                }

                Shell::new(client, tracker.clone(), *port).run().await?;
            }
        }

        Ok(())
    }
}

/// Interactive prompt driving one peer
struct Shell {
    client: Arc<PeerClient>,
    tracker: String,
    port: u16,
    downloads: Vec<JoinHandle<()>>,
}

impl Shell {
    fn new(client: Arc<PeerClient>, tracker: String, port: u16) -> Self {
        Self {
            client,
            tracker,
            port,
            downloads: Vec::new(),
        }
    }

    async fn run(mut self) -> Result<()> {
        self.join().await;
        print_help();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();

            match command {
                "" => {}
                "peers" => match self.client.get_peers_list().await {
                    Ok(peers) if peers.is_empty() => println!("No other peers"),
                    Ok(peers) => peers.iter().for_each(|peer| println!("  {}", peer)),
                    Err(e) => println!("Unable to list peers: {}", e),
                },
                "shared" => {
                    for file in self.client.shared_files() {
                        println!("  {} ({})", file.name, file.local_path.display());
                    }
                }
                "available" => match self.client.get_available_list().await {
                    Ok(files) if files.is_empty() => println!("No files available"),
                    Ok(files) => {
                        for (name, owner) in files {
                            println!("  {} @ {}", name, owner);
                        }
                    }
                    Err(e) => println!("Unable to list available files: {}", e),
                },
                "share" => match self.client.add_share_file(rest).await {
                    Ok(name) => println!("Sharing {}", name),
                    Err(P2pError::DuplicateShare(name)) => {
                        println!("Unable to add file \"{}\" because it already exists", name)
                    }
                    Err(e) => println!("Unable to share \"{}\": {}", rest, e),
                },
                "unshare" => match self.client.rem_share_file(rest).await {
                    Ok(name) => println!("Stopped sharing {}", name),
                    Err(e) => println!("Unable to unshare \"{}\": {}", rest, e),
                },
                "download" => {
                    for name in rest.split_whitespace() {
                        self.start_download(name.to_string());
                    }
                }
                "port" => match self.client.get_acceptor_port().await {
                    Ok(port) => println!("Acceptor port {}", port),
                    Err(e) => println!("{}", e),
                },
                "join" => self.join().await,
                "leave" => {
                    self.client.leave_network().await;
                    println!("Left the network");
                }
                "help" => print_help(),
                "quit" | "exit" => break,
                other => println!("Unknown command \"{}\", try help", other),
            }
        }

        self.client.leave_network().await;
        for download in self.downloads {
            let _ = download.await;
        }

        Ok(())
    }

    async fn join(&self) {
        match self.client.join_network(&self.tracker, self.port).await {
            Ok(()) => {
                let port = self.client.get_acceptor_port().await.unwrap_or_default();
                println!(
                    "Connected to {}:{}, accepting peers on port {}",
                    self.tracker, self.port, port
                );
            }
            Err(e) => println!(
                "Unable to connect to Connection Manager: {}\n\
                 Make sure the address and port are valid and that it is running.",
                e
            ),
        }
    }

    fn start_download(&mut self, name: String) {
        println!("Downloading \"{}\", you will be notified once it completes", name);

        let handle = self.client.spawn_download(name.clone());
        self.downloads.push(tokio::spawn(async move {
            match handle.await {
                Ok(Ok(path)) => println!("\"{}\" finished downloading to {}", name, path.display()),
                Ok(Err(e)) => println!("\"{}\" download failed: {}", name, advice(&e)),
                Err(e) => println!("\"{}\" download task failed: {}", name, e),
            }
        }));
    }
}

/// Failure text that tells the user what to do next
fn advice(err: &P2pError) -> String {
    match (err, err.download_cause()) {
        (P2pError::FileNotAvailable(_), _) => format!("{} (refresh the listing)", err),
        (_, Some(DownloadError::OwnerNoLongerSharing)) => {
            format!("{} (the owner stopped sharing it, refresh the listing)", err)
        }
        (_, Some(DownloadError::TruncatedTransfer { .. })) => {
            format!("{} (transfer interrupted, try again)", err)
        }
        (_, Some(DownloadError::PeerUnreachable(..) | DownloadError::Timeout(_))) => {
            format!("{} (owner unreachable, try again)", err)
        }
        _ => err.to_string(),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  peers               list other peers");
    println!("  shared              list files you share");
    println!("  available           list files offered by other peers");
    println!("  share <path>        share a file");
    println!("  unshare <path|name> stop sharing a file");
    println!("  download <name>...  download files in the background");
    println!("  port                show the acceptor port");
    println!("  join | leave        connect to or leave the network");
    println!("  quit                leave and exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_command() {
        let cli = <Cli as Parser>::try_parse_from([
            "p2p-share", "peer", "-t", "127.0.0.1", "-p", "9001", "-s", "a.txt", "-s", "b.txt",
        ])
        .unwrap();

        match cli.command {
            Commands::Peer {
                tracker, port, share, output, ..
            } => {
                assert_eq!(tracker, "127.0.0.1");
                assert_eq!(port, 9001);
                assert_eq!(share, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert_eq!(output, PathBuf::from("./downloads"));
            }
            _ => panic!("expected peer command"),
        }
    }

    #[test]
    fn test_advice_distinguishes_failures() {
        let gone = P2pError::Download {
            name: "a".to_string(),
            cause: DownloadError::OwnerNoLongerSharing,
        };
        let cut = P2pError::Download {
            name: "a".to_string(),
            cause: DownloadError::TruncatedTransfer {
                received: 1,
                expected: 2,
            },
        };

        assert!(advice(&gone).contains("refresh"));
        assert!(advice(&cut).contains("try again"));
        assert!(advice(&P2pError::FileNotAvailable("a".to_string())).contains("refresh"));
    }
}
