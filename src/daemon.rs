//! Binding the socketmap responder's listening surface (spec.md §4.4).
//!
//! Kept in the teacher's shape: bind a std socket, set it non-blocking,
//! hand it to tokio via `from_std`
//! (`examples/NLnetLabs-cascade`'s `SocketProvider::prepare_tcp_listener`).
//! What's gone is anything to do with systemd socket activation or
//! privilege dropping — this daemon has neither in its surface (spec.md
//! §1 scopes `daemonbase`-style process management out as an external
//! collaborator it doesn't specify).

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::error::ExitError;

/// Either half of the listening surface (spec.md §4.4: "Either a TCP
/// listener ... or a UNIX stream listener").
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

/// Bind the listener named by `config`.
pub fn bind(config: &Config) -> Result<Listener, ExitError> {
    match &config.path {
        Some(path) => bind_unix(path, config.mode).map(Listener::Unix),
        None => bind_tcp(config.host.as_str(), config.port, config.reuse_port).map(Listener::Tcp),
    }
}

fn bind_tcp(host: &str, port: u16, reuse_port: bool) -> Result<tokio::net::TcpListener, ExitError> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|_| ExitError::Config(format!("invalid listen address: {host}:{port}")))?;

    let to_error = |err: std::io::Error| ExitError::Bind { addr, source: err };

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(to_error)?;
    socket.set_reuse_address(true).map_err(to_error)?;
    if reuse_port {
        set_reuse_port(&socket).map_err(to_error)?;
    }
    socket.set_nonblocking(true).map_err(to_error)?;
    socket.bind(&addr.into()).map_err(to_error)?;
    socket.listen(1024).map_err(to_error)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(to_error)
}

/// `SO_REUSEPORT` on most unix platforms, `SO_REUSEPORT_LB` on FreeBSD
/// (load-balancing variant), nothing extra where neither exists — the
/// earlier `set_reuse_address` already covers that case.
#[cfg(target_os = "freebsd")]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT_LB,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "freebsd")))]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}

fn bind_unix(path: &std::path::Path, mode: Option<u32>) -> Result<tokio::net::UnixListener, ExitError> {
    let to_error = |err: std::io::Error| ExitError::BindUnix {
        path: path.to_path_buf(),
        source: err,
    };

    if path.exists() {
        std::fs::remove_file(path).map_err(to_error)?;
    }

    let std_listener = std::os::unix::net::UnixListener::bind(path).map_err(to_error)?;
    std_listener.set_nonblocking(true).map_err(to_error)?;

    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(to_error)?;
    }

    tokio::net::UnixListener::from_std(std_listener).map_err(to_error)
}
