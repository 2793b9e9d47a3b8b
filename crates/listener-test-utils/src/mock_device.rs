// mock_device: A TCP client that behaves like a tracker on a flaky link.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A connected fake device.
pub struct MockDevice {
    stream: TcpStream,
}

impl MockDevice {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(MockDevice { stream })
    }

    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Write `bytes` as separate writes of at most `chunk` bytes, yielding
    /// between writes so the listener sees fragmented reads.
    pub async fn send_in_chunks(&mut self, bytes: &[u8], chunk: usize) -> std::io::Result<()> {
        for part in bytes.chunks(chunk.max(1)) {
            self.stream.write_all(part).await?;
            self.stream.flush().await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Read exactly `n` reply bytes, or fail after `timeout`.
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        tokio::time::timeout(timeout, self.stream.read_exact(&mut out))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply"))??;
        Ok(out)
    }

    /// Wait until the listener closes the connection. Any bytes received
    /// before the close are discarded. Returns false on timeout.
    pub async fn wait_closed(&mut self, timeout: Duration) -> bool {
        let mut sink = [0u8; 256];
        tokio::time::timeout(timeout, async {
            loop {
                match self.stream.read(&mut sink).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .is_ok()
    }

    /// Half-close the write side, as a device hanging up would.
    pub async fn finish(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
