//! `strand echo`: TCP echo server

use std::io;
use strand_core::{Runtime, RuntimeOptions};
use strand_tools::{TcpListener, TcpStream};

pub fn execute(
    options: RuntimeOptions,
    host: String,
    port: u16,
    max_connections: Option<usize>,
) -> anyhow::Result<()> {
    let runtime = Runtime::new(options)?;
    let served = runtime.run(move |handle| async move {
        let listener = TcpListener::bind(&handle, (host.as_str(), port))?;
        tracing::info!(addr = %listener.local_addr()?, "echo server listening");

        let mut served = 0usize;
        while max_connections.is_none_or(|max| served < max) {
            let (stream, peer) = listener.accept().await?;
            served += 1;
            tracing::debug!(%peer, "accepted");
            // Detached: run() keeps going until every connection is done
            let _ = handle.spawn(async move {
                match echo(&stream).await {
                    Ok(bytes) => tracing::debug!(%peer, bytes, "connection closed"),
                    Err(err) => tracing::warn!(%peer, %err, "connection failed"),
                }
            });
        }
        Ok::<_, io::Error>(served)
    })??;

    println!("Served {} connection(s)", served);
    Ok(())
}

/// Copy everything read back to the peer until it closes; returns the byte count
async fn echo(stream: &TcpStream) -> io::Result<usize> {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        stream.write_all(&buf[..n]).await?;
        total += n;
    }
}
