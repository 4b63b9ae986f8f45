//! Minimal terminal controller for the remote control channel

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::supervisor::QUIT_REPLY;

/// Send `command` and wait for its reply line.
pub async fn send_command(stream: &mut BufReader<TcpStream>, command: &str) -> anyhow::Result<String> {
    stream
        .get_mut()
        .write_all(format!("{}\n", command.trim()).as_bytes())
        .await
        .context("failed to send command")?;

    let mut reply = String::new();
    let read = stream.read_line(&mut reply).await.context("failed to read reply")?;
    anyhow::ensure!(read > 0, "control connection closed");
    Ok(reply.trim_end().to_string())
}

/// Read commands from stdin until EOF or the server answers `QUIT`. Lines
/// published on the output socket, when given, are printed as they arrive.
pub async fn run_client(control: &str, output: Option<&str>) -> anyhow::Result<()> {
    let stream = TcpStream::connect(control)
        .await
        .with_context(|| format!("cannot connect to control socket {control}"))?;
    let mut stream = BufReader::new(stream);

    if let Some(output) = output {
        let echo = TcpStream::connect(output)
            .await
            .with_context(|| format!("cannot connect to output socket {output}"))?;
        tokio::spawn(async move {
            let mut lines = BufReader::new(echo).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("> {line}");
            }
            debug!("Output socket closed");
        });
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = send_command(&mut stream, &line).await?;
        println!("{reply}");
        if reply == QUIT_REPLY {
            break;
        }
    }
    Ok(())
}
