//! Fire-and-forget protocol tracing over loopback UDP. A listener on port
//! 17474 sees the session from outside the process; nobody listening costs
//! nothing. Compiled out without the `diagnostics` feature.

#[cfg(feature = "diagnostics")]
mod imp {
    use std::net::UdpSocket;
    use std::sync::OnceLock;

    const SINK_ADDR: &str = "127.0.0.1:17474";

    static SOCKET: OnceLock<Option<UdpSocket>> = OnceLock::new();

    pub fn emit(tag: &str, payload: &str) {
        let socket = SOCKET.get_or_init(|| {
            let socket = UdpSocket::bind("127.0.0.1:0").ok()?;
            socket.set_nonblocking(true).ok()?;
            Some(socket)
        });
        if let Some(socket) = socket {
            let _ = socket.send_to(format!("{tag}: {payload}").as_bytes(), SINK_ADDR);
        }
    }
}

#[cfg(not(feature = "diagnostics"))]
mod imp {
    pub fn emit(_tag: &str, _payload: &str) {}
}

pub use imp::emit;
