//! Persistent framed channel to the cloud (spec.md §4.8): a thin wrapper
//! over a `tokio-tungstenite` text-frame WebSocket that turns peer-close and
//! protocol errors into a sticky [`CmError::Unavailable`], which is the
//! cloud link's signal to fall back to Discovering.

use cm_ore::error::CmError;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type CloudStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client identity presented to the cloud peer, and the CA it validates the
/// peer against (spec §6 "mTLS").
pub struct TlsCredentials {
    pub client_cert_chain: Vec<rustls::Certificate>,
    pub client_key: rustls::PrivateKey,
    pub root_ca: Vec<rustls::Certificate>,
}

/// Builds the mTLS client config shared by the WebSocket transport and
/// (via [`crate::discovery`]) the discovery HTTP client: client cert/key
/// presented to the peer, validated against `credentials.root_ca`
/// (spec §4.7/§6 "mTLS").
pub fn build_client_config(credentials: &TlsCredentials) -> Result<rustls::ClientConfig, CmError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in &credentials.root_ca {
        roots.add(cert).map_err(|e| CmError::internal(format!("invalid CA certificate: {e}")))?;
    }

    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(credentials.client_cert_chain.clone(), credentials.client_key.clone())
        .map_err(|e| CmError::internal(format!("invalid client certificate: {e}")))
}

fn build_connector(credentials: &TlsCredentials) -> Result<Connector, CmError> {
    let config = build_client_config(credentials)?;
    Ok(Connector::Rustls(std::sync::Arc::new(config)))
}

/// Dials `url` and completes the WebSocket handshake over mTLS.
pub async fn connect(url: &Url, credentials: &TlsCredentials) -> Result<CloudStream, CmError> {
    let connector = build_connector(credentials)?;
    let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
        .await
        .map_err(|e| CmError::unavailable(format!("cloud transport connect failed: {e}")))?;
    Ok(stream)
}

/// Sends one complete envelope as a text frame.
pub async fn send<S>(sink: &mut S, payload: String) -> Result<(), CmError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(payload)).await.map_err(|e| CmError::unavailable(format!("cloud transport send failed: {e}")))
}

/// The result of interpreting one frame read from the cloud peer.
pub enum Frame {
    /// A complete envelope.
    Data(String),
    /// A non-data frame (ping/pong/binary); caller should keep reading.
    Ignored,
    /// The peer closed the stream or it errored; this is the cloud link's
    /// signal to fall back to Discovering.
    Closed(CmError),
}

pub fn interpret_frame(frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>) -> Frame {
    match frame {
        Some(Ok(Message::Text(text))) => Frame::Data(text),
        Some(Ok(Message::Close(_))) | None => Frame::Closed(CmError::unavailable("cloud transport closed by peer")),
        Some(Ok(_)) => Frame::Ignored,
        Some(Err(e)) => Frame::Closed(CmError::unavailable(format!("cloud transport recv failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_text_frame_is_data() {
        assert!(matches!(interpret_frame(Some(Ok(Message::Text("hi".into())))), Frame::Data(text) if text == "hi"));
    }

    #[test]
    fn ping_and_binary_frames_are_ignored_not_fatal() {
        assert!(matches!(interpret_frame(Some(Ok(Message::Ping(vec![])))), Frame::Ignored));
        assert!(matches!(interpret_frame(Some(Ok(Message::Binary(vec![1])))), Frame::Ignored));
    }

    #[test]
    fn stream_end_and_close_frame_are_both_closed() {
        assert!(matches!(interpret_frame(None), Frame::Closed(_)));
        assert!(matches!(interpret_frame(Some(Ok(Message::Close(None)))), Frame::Closed(_)));
    }

    #[test]
    fn an_empty_client_key_is_rejected_as_an_invalid_certificate() {
        let credentials = TlsCredentials { client_cert_chain: vec![rustls::Certificate(vec![1, 2, 3])], client_key: rustls::PrivateKey(vec![]), root_ca: vec![] };
        let err = match build_connector(&credentials) {
            Err(e) => e,
            Ok(_) => panic!("expected an invalid certificate error"),
        };
        assert_eq!(err.kind(), cm_ore::ErrorKind::Internal);
    }
}
