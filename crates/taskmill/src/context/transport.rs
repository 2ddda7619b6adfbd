//! IPC transport for process units.
//!
//! The controller binds a Unix listener per unit and hands the connect info
//! to the child through an environment variable. Platform split follows the
//! usual pattern: abstract-namespace sockets on Linux (no filesystem entries,
//! auto-cleanup), filesystem sockets elsewhere.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

/// Environment variable carrying the serialized [`UnitConnectInfo`].
pub const CONNECT_INFO_ENV: &str = "TASKMILL_SOCKET";

/// Byte length of the handshake authentication key, known to both sides.
pub const KEY_LENGTH: usize = 32;

/// Fresh random authentication key, exactly [`KEY_LENGTH`] bytes of hex.
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Connect info passed to the child for reaching its socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UnitConnectInfo {
    Named {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    Abstract {
        name: String,
    },
}

/// Controller-side listener for exactly one unit connection.
pub struct UnitListener {
    listener: UnixListener,
    info: UnitConnectInfo,
    // Filesystem socket directory to remove on drop, if any.
    cleanup_dir: Option<PathBuf>,
}

impl UnitListener {
    /// Bind using the platform default transport.
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::bind_abstract()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::bind_named()
        }
    }

    pub fn bind_named() -> io::Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "taskmill-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("unit.sock");

        tracing::debug!(transport_type = "named", path = %path.display(), "binding unit socket");
        let listener = UnixListener::bind(&path)?;

        Ok(Self {
            listener,
            info: UnitConnectInfo::Named { path },
            cleanup_dir: Some(dir),
        })
    }

    #[cfg(target_os = "linux")]
    pub fn bind_abstract() -> io::Result<Self> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let name = format!(
            "taskmill-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );

        tracing::debug!(transport_type = "abstract", name = %name, "binding unit socket");
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        Ok(Self {
            listener,
            info: UnitConnectInfo::Abstract { name },
            cleanup_dir: None,
        })
    }

    pub fn connect_info(&self) -> &UnitConnectInfo {
        &self.info
    }

    /// Connect info serialized for the child's environment.
    pub fn connect_info_env(&self) -> io::Result<String> {
        serde_json::to_string(&self.info).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Accept the single expected connection from the unit.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!("unit connected");
        Ok(stream)
    }
}

impl Drop for UnitListener {
    fn drop(&mut self) {
        if let Some(dir) = self.cleanup_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(error = %e, dir = %dir.display(), "failed to clean up socket directory");
            }
        }
    }
}

/// Connect from the unit side.
pub async fn connect(info: UnitConnectInfo) -> io::Result<UnixStream> {
    match info {
        UnitConnectInfo::Named { path } => {
            tracing::trace!(path = %path.display(), "connecting to controller socket");
            UnixStream::connect(&path).await
        }
        #[cfg(target_os = "linux")]
        UnitConnectInfo::Abstract { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            tracing::trace!(name = %name, "connecting to controller socket");
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}

/// Read the connect info placed in the environment by the controller.
pub fn connect_info_from_env() -> io::Result<UnitConnectInfo> {
    let raw = std::env::var(CONNECT_INFO_ENV).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{CONNECT_INFO_ENV} is not set; not spawned by a taskmill controller?"),
        )
    })?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_has_fixed_length() {
        let key = generate_key();
        assert_eq!(key.len(), KEY_LENGTH);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn connect_info_roundtrips() {
        let info = UnitConnectInfo::Named {
            path: PathBuf::from("/tmp/taskmill-1/unit.sock"),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: UnitConnectInfo = serde_json::from_str(&json).unwrap();
        match parsed {
            UnitConnectInfo::Named { path } => {
                assert_eq!(path, PathBuf::from("/tmp/taskmill-1/unit.sock"));
            }
            #[cfg(target_os = "linux")]
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn listener_accepts_a_connection() {
        let listener = UnitListener::bind().unwrap();
        let info = listener.connect_info().clone();

        let client = tokio::spawn(async move { connect(info).await });
        let accepted = listener.accept().await;
        assert!(accepted.is_ok());
        assert!(client.await.unwrap().is_ok());
    }
}
