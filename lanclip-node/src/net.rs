//! Socket plumbing shared by the services: one message per TCP connection,
//! written then half-closed by the sender and read to EOF by the receiver.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use lanclip_core::{CoreError, Message, decode_message, encode_message};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    time::timeout,
};

use crate::error::{Capability, NodeError};

/// Opens a fresh connection to `address`, writes `message` and closes.
/// `bind_ip` pins the source address when it is not the wildcard.
pub async fn send_message(
    address: SocketAddr,
    message: &Message,
    bind_ip: IpAddr,
    connect_timeout: Duration,
) -> Result<(), NodeError> {
    let frame = encode_message(message)?;
    let exchange = async {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if !bind_ip.is_unspecified() && bind_ip.is_ipv4() == address.is_ipv4() {
            socket.bind(SocketAddr::new(bind_ip, 0))?;
        }
        let mut stream = socket.connect(address).await?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    match timeout(connect_timeout, exchange).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(NodeError::PeerUnreachable {
            address,
            reason: err.to_string(),
        }),
        Err(_) => Err(NodeError::PeerUnreachable {
            address,
            reason: format!("timed out after {:?}", connect_timeout),
        }),
    }
}

/// Reads the single message of an inbound connection.
pub async fn read_message(
    stream: TcpStream,
    peer: SocketAddr,
    max_bytes: usize,
    read_timeout: Duration,
) -> Result<Message, NodeError> {
    let mut buf = Vec::new();
    let mut limited = stream.take(max_bytes as u64 + 1);
    match timeout(read_timeout, limited.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(NodeError::Receive {
                address: peer,
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(NodeError::Receive {
                address: peer,
                reason: format!("no complete message within {:?}", read_timeout),
            });
        }
    }

    if buf.len() > max_bytes {
        return Err(CoreError::MessageTooLarge {
            size: buf.len(),
            max: max_bytes,
        }
        .into());
    }
    Ok(decode_message(&buf)?)
}

pub async fn bind_tcp(
    capability: Capability,
    ip: IpAddr,
    port: u16,
) -> Result<TcpListener, NodeError> {
    let address = SocketAddr::new(ip, port);
    TcpListener::bind(address)
        .await
        .map_err(|source| NodeError::BindFailure {
            capability,
            address,
            source,
        })
}

pub async fn bind_udp(
    capability: Capability,
    ip: IpAddr,
    port: u16,
) -> Result<UdpSocket, NodeError> {
    let address = SocketAddr::new(ip, port);
    let bind_failure = |source| NodeError::BindFailure {
        capability,
        address,
        source,
    };
    let socket = UdpSocket::bind(address).await.map_err(bind_failure)?;
    socket.set_broadcast(true).map_err(bind_failure)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use lanclip_core::Payload;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn message_crosses_one_connection() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();

        let sent = Message::new(
            Payload::ClipboardData {
                text: "hello".to_owned(),
            },
            "127.0.0.1",
            "a",
        );
        let send = send_message(address, &sent, LOCALHOST, Duration::from_secs(2));
        let receive = async {
            let (stream, peer) = listener.accept().await.unwrap();
            read_message(stream, peer, 1024, Duration::from_secs(2)).await
        };
        let (send_result, received) = tokio::join!(send, receive);

        send_result.unwrap();
        assert_eq!(received.unwrap(), sent);
    }

    #[tokio::test]
    async fn refused_connection_is_peer_unreachable() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let message = Message::new(Payload::Ping, "127.0.0.1", "a");
        let err = send_message(address, &message, LOCALHOST, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        let _client = TcpStream::connect(address).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let err = read_message(stream, peer, 1024, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Receive { .. }));
    }

    #[tokio::test]
    async fn oversized_and_garbage_payloads_are_rejected() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(address).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        client.write_all(&[b'x'; 64]).await.unwrap();
        client.shutdown().await.unwrap();
        let err = read_message(stream, peer, 16, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Message(CoreError::MessageTooLarge { .. })
        ));

        let mut client = TcpStream::connect(address).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        client.write_all(b"{\"type\":").await.unwrap();
        client.shutdown().await.unwrap();
        let err = read_message(stream, peer, 1024, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Message(CoreError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn second_bind_on_same_port_is_a_bind_failure() {
        let first = bind_tcp(Capability::Pairing, LOCALHOST, 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind_tcp(Capability::Pairing, LOCALHOST, port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::BindFailure {
                capability: Capability::Pairing,
                ..
            }
        ));
    }
}
