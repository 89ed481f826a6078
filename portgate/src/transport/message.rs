//! Protobuf messages exchanged with the tunnel server.
//!
//! Field numbers are part of the wire contract with the server and must not
//! be renumbered.

use std::collections::HashMap;

use bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TunnelProtocol {
    Http = 0,
    Https = 1,
    Tcp = 2,
}

impl From<crate::config::Protocol> for TunnelProtocol {
    fn from(value: crate::config::Protocol) -> Self {
        match value {
            crate::config::Protocol::Http => TunnelProtocol::Http,
            crate::config::Protocol::Https => TunnelProtocol::Https,
            crate::config::Protocol::Tcp => TunnelProtocol::Tcp,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ControlType {
    Unknown = 0,
    TunnelClosed = 1,
    RateLimit = 2,
    Reconnect = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateTunnelRequest {
    #[prost(string, tag = "1")]
    pub auth_token: String,
    #[prost(enumeration = "TunnelProtocol", tag = "2")]
    pub protocol: i32,
    #[prost(string, tag = "3")]
    pub local_address: String,
    #[prost(string, tag = "4")]
    pub subdomain: String,
    #[prost(string, tag = "5")]
    pub webhook_app_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateTunnelResponse {
    #[prost(string, tag = "1")]
    pub tunnel_id: String,
    #[prost(string, tag = "2")]
    pub public_url: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub query: String,
    #[prost(map = "string, message", tag = "4")]
    pub headers: HashMap<String, HeaderValues>,
    #[prost(bytes = "bytes", tag = "5")]
    pub body: Bytes,
    #[prost(string, tag = "6")]
    pub remote_addr: String,
}

impl HttpRequest {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// All values of a header across every spelling of its name.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.values.iter().map(String::as_str))
    }

    /// `path[?query]` as sent on the request line.
    pub fn path_and_query(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, self.query)
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpResponse {
    /// Only set on the first frame of a response.
    #[prost(int32, tag = "1")]
    pub status_code: i32,
    /// Only set on the first frame of a response.
    #[prost(map = "string, message", tag = "2")]
    pub headers: HashMap<String, HeaderValues>,
    #[prost(bytes = "bytes", tag = "3")]
    pub body: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpSegment {
    /// Empty payload signals that the sending side is done.
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    /// Advisory only; the client never reorders on it.
    #[prost(int64, tag = "2")]
    pub sequence: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(oneof = "proxy_request::Payload", tags = "2, 3")]
    pub payload: Option<proxy_request::Payload>,
}

pub mod proxy_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Http(super::HttpRequest),
        #[prost(message, tag = "3")]
        Tcp(super::TcpSegment),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub tunnel_id: String,
    #[prost(oneof = "proxy_response::Payload", tags = "3, 4")]
    pub payload: Option<proxy_response::Payload>,
    #[prost(bool, tag = "5")]
    pub end_of_stream: bool,
}

pub mod proxy_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "3")]
        Http(super::HttpResponse),
        #[prost(message, tag = "4")]
        Tcp(super::TcpSegment),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlMessage {
    #[prost(enumeration = "ControlType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub tunnel_id: String,
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorMessage {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub code: String,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyMessage {
    #[prost(oneof = "proxy_message::Message", tags = "1, 2, 3, 4")]
    pub message: Option<proxy_message::Message>,
}

pub mod proxy_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Request(super::ProxyRequest),
        #[prost(message, tag = "2")]
        Response(super::ProxyResponse),
        #[prost(message, tag = "3")]
        Control(super::ControlMessage),
        #[prost(message, tag = "4")]
        Error(super::ErrorMessage),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub tunnel_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
}

/// Builds the pipe-delimited string the server uses to bind a proxy stream
/// to its tunnel record. Empty fields stay empty between the pipes.
pub fn registration_sentinel(
    subdomain: &str,
    token: &str,
    local_addr: &str,
    public_url: &str,
    persistent_name: &str,
) -> String {
    [subdomain, token, local_addr, public_url, persistent_name].join("|")
}

impl ProxyMessage {
    pub fn registration(sentinel: String) -> Self {
        Self::control(ControlMessage {
            r#type: ControlType::Unknown as i32,
            tunnel_id: sentinel,
            metadata: HashMap::new(),
        })
    }

    pub fn control(control: ControlMessage) -> Self {
        Self {
            message: Some(proxy_message::Message::Control(control)),
        }
    }

    pub fn request(request_id: impl Into<String>, payload: proxy_request::Payload) -> Self {
        Self {
            message: Some(proxy_message::Message::Request(ProxyRequest {
                request_id: request_id.into(),
                payload: Some(payload),
            })),
        }
    }

    pub fn http_response(
        request_id: &str,
        tunnel_id: &str,
        response: HttpResponse,
        end_of_stream: bool,
    ) -> Self {
        Self {
            message: Some(proxy_message::Message::Response(ProxyResponse {
                request_id: request_id.to_string(),
                tunnel_id: tunnel_id.to_string(),
                payload: Some(proxy_response::Payload::Http(response)),
                end_of_stream,
            })),
        }
    }

    /// Outbound TCP segment. An empty `data` is the close signal.
    pub fn tcp_response(request_id: &str, tunnel_id: &str, data: Bytes) -> Self {
        let end_of_stream = data.is_empty();
        Self {
            message: Some(proxy_message::Message::Response(ProxyResponse {
                request_id: request_id.to_string(),
                tunnel_id: tunnel_id.to_string(),
                payload: Some(proxy_response::Payload::Tcp(TcpSegment { data, sequence: 0 })),
                end_of_stream,
            })),
        }
    }

    pub fn error(request_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(proxy_message::Message::Error(ErrorMessage {
                request_id: request_id.to_string(),
                code: code.to_string(),
                message: message.into(),
            })),
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match &self.message {
            Some(proxy_message::Message::Request(_)) => "request",
            Some(proxy_message::Message::Response(_)) => "response",
            Some(proxy_message::Message::Control(_)) => "control",
            Some(proxy_message::Message::Error(_)) => "error",
            None => "empty",
        }
    }
}

/// Converts an `http` header map into the multi-valued wire representation.
pub fn headers_to_wire(headers: &http::HeaderMap) -> HashMap<String, HeaderValues> {
    let mut out: HashMap<String, HeaderValues> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .values
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}
