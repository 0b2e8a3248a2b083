//! Service-manager readiness notification (`NOTIFY_SOCKET`, spec.md §6).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/asdnotify.py`'s
//! `AsyncSystemdNotifier`: an abstract-namespace-aware `AF_UNIX`
//! `SOCK_DGRAM` socket, best-effort `sendto` with `MSG_NOSIGNAL`. A
//! missing or unusable `NOTIFY_SOCKET` is not an error — plenty of
//! supervisors (or none at all) don't set it.

use std::os::unix::net::UnixDatagram;

#[cfg(target_os = "linux")]
use std::os::linux::net::SocketAddrExt;

/// Best-effort systemd notifier. `notify()` is a no-op if `NOTIFY_SOCKET`
/// was unset or the socket could not be created.
pub struct Notifier {
    socket: Option<(UnixDatagram, std::os::unix::net::SocketAddr)>,
}

impl Notifier {
    pub fn from_env() -> Self {
        let Ok(env_addr) = std::env::var("NOTIFY_SOCKET") else {
            return Self { socket: None };
        };

        let socket = match UnixDatagram::unbound() {
            Ok(sock) => sock,
            Err(_) => return Self { socket: None },
        };

        let addr = if let Some(_abstract_name) = env_addr.strip_prefix('@') {
            #[cfg(target_os = "linux")]
            {
                std::os::unix::net::SocketAddr::from_abstract_name(_abstract_name.as_bytes())
            }
            #[cfg(not(target_os = "linux"))]
            {
                // Abstract-namespace sockets are a Linux-only concept; on
                // other unices a leading '@' can't name a real address.
                Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "abstract-namespace NOTIFY_SOCKET is only supported on linux",
                ))
            }
        } else {
            std::os::unix::net::SocketAddr::from_pathname(&env_addr)
        };

        match addr {
            Ok(addr) => Self {
                socket: Some((socket, addr)),
            },
            Err(_) => Self { socket: None },
        }
    }

    /// Send a status line (e.g. `READY=1`, `STOPPING=1`). Failures are
    /// swallowed: a readiness ping is advisory, never load-bearing.
    pub fn notify(&self, status: &str) {
        if let Some((socket, addr)) = &self.socket {
            let _ = socket.send_to_addr(status.as_bytes(), addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_notify_socket_is_a_silent_no_op() {
        // SAFETY: test runs single-threaded w.r.t. this env var.
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
        }
        let notifier = Notifier::from_env();
        notifier.notify("READY=1");
        assert!(notifier.socket.is_none());
    }
}
