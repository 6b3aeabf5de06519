use scp_transport::OperationKind;

pub(crate) const BIND: OperationKind = OperationKind::new("scp.transport.tcp.bind_failed", "tcp bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("scp.transport.tcp.accept_failed", "tcp accept");
pub(crate) const CONNECT: OperationKind =
    OperationKind::new("scp.transport.tcp.connect_failed", "tcp connect");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("scp.transport.tcp.configure_failed", "tcp configure");

pub(crate) const STREAM: scp_transport::StreamOperations = scp_transport::StreamOperations {
    scheme: "tcp",
    read: OperationKind::new("scp.transport.tcp.read_failed", "tcp read"),
    write: OperationKind::new("scp.transport.tcp.write_failed", "tcp write"),
    close: OperationKind::new("scp.transport.tcp.shutdown_failed", "tcp shutdown"),
};
