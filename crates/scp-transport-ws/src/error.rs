use scp_transport::{OperationKind, TransportError};
use tokio_tungstenite::tungstenite;

pub(crate) const BIND: OperationKind = OperationKind::new("scp.transport.ws.bind_failed", "ws bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("scp.transport.ws.accept_failed", "ws accept");
pub(crate) const UPGRADE: OperationKind =
    OperationKind::new("scp.transport.ws.upgrade_failed", "ws upgrade");
pub(crate) const CONNECT: OperationKind =
    OperationKind::new("scp.transport.ws.connect_failed", "ws connect");
pub(crate) const READ: OperationKind = OperationKind::new("scp.transport.ws.read_failed", "ws read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("scp.transport.ws.write_failed", "ws write");
pub(crate) const CLOSE: OperationKind =
    OperationKind::new("scp.transport.ws.close_failed", "ws close");

/// 将 tungstenite 错误折算为传输层错误。
pub(crate) fn map_ws_error(kind: OperationKind, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(source) => TransportError::io(kind, source),
        tungstenite::Error::ConnectionClosed => TransportError::eof(kind),
        tungstenite::Error::AlreadyClosed => TransportError::closed(kind),
        other => TransportError::protocol(kind, other.to_string()),
    }
}
