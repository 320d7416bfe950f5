use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

/// A listening address in one of the accepted textual forms:
///
/// - `host:port`: TCP on a resolved address
/// - `port`: TCP on `0.0.0.0:port`
/// - `unix:/path/to/socket`: Unix domain stream socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for BindAddr {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<BindAddr, io::Error> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid(s));
            }
            return Ok(BindAddr::Unix(PathBuf::from(path)));
        }

        if let Ok(port) = s.parse::<u16>() {
            return Ok(BindAddr::Tcp(SocketAddr::from(([0, 0, 0, 0], port))));
        }

        match s.to_socket_addrs() {
            Ok(mut addrs) => addrs.next().ok_or_else(|| invalid(s)).map(BindAddr::Tcp),
            Err(_) => Err(invalid(s)),
        }
    }
}

fn invalid(s: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid bind address: {:?}", s),
    )
}

impl fmt::Display for BindAddr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BindAddr::Tcp(addr) => write!(fmt, "{}", addr),
            BindAddr::Unix(path) => write!(fmt, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BindAddr;
    use std::net::SocketAddr;

    #[test]
    fn parses_host_port() {
        let addr: BindAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(
            addr,
            BindAddr::Tcp("127.0.0.1:8080".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn bare_port_binds_all_interfaces() {
        let addr: BindAddr = "9000".parse().unwrap();
        assert_eq!(
            addr,
            BindAddr::Tcp("0.0.0.0:9000".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn unix_path() {
        let addr: BindAddr = "unix:/tmp/app.sock".parse().unwrap();
        assert_eq!(addr, BindAddr::Unix("/tmp/app.sock".into()));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<BindAddr>().is_err());
        assert!("unix:".parse::<BindAddr>().is_err());
        assert!("not an address".parse::<BindAddr>().is_err());
    }
}
