use futures_util::Stream;
use http::uri::PathAndQuery;
use tonic::Status;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::transport::Channel;

use super::message::{
    CreateTunnelRequest, CreateTunnelResponse, HeartbeatRequest, HeartbeatResponse, ProxyMessage,
};

/// Send and receive limit for a single RPC message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const CREATE_TUNNEL: &str = "/portgate.v1.TunnelService/CreateTunnel";
const PROXY_STREAM: &str = "/portgate.v1.TunnelService/ProxyStream";
const HEARTBEAT: &str = "/portgate.v1.TunnelService/Heartbeat";

/// Client for the tunnel server's RPC service.
#[derive(Debug, Clone)]
pub struct TunnelServiceClient {
    inner: Grpc<Channel>,
}

impl TunnelServiceClient {
    pub fn new(channel: Channel) -> Self {
        let inner = Grpc::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        Self { inner }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("Service was not ready: {e}")))
    }

    pub async fn create_tunnel(
        &mut self,
        request: CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, Status> {
        self.ready().await?;
        let codec: ProstCodec<CreateTunnelRequest, CreateTunnelResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(CREATE_TUNNEL);
        let response = self
            .inner
            .unary(tonic::Request::new(request), path, codec)
            .await?;
        Ok(response.into_inner())
    }

    /// Opens the bidirectional proxy stream. `outbound` feeds every frame
    /// the agent sends; the returned stream yields every frame the server
    /// sends.
    pub async fn proxy_stream<S>(&mut self, outbound: S) -> Result<Streaming<ProxyMessage>, Status>
    where
        S: Stream<Item = ProxyMessage> + Send + 'static,
    {
        self.ready().await?;
        let codec: ProstCodec<ProxyMessage, ProxyMessage> = ProstCodec::default();
        let path = PathAndQuery::from_static(PROXY_STREAM);
        let response = self
            .inner
            .streaming(tonic::Request::new(outbound), path, codec)
            .await?;
        Ok(response.into_inner())
    }

    pub async fn heartbeat<S>(&mut self, outbound: S) -> Result<Streaming<HeartbeatResponse>, Status>
    where
        S: Stream<Item = HeartbeatRequest> + Send + 'static,
    {
        self.ready().await?;
        let codec: ProstCodec<HeartbeatRequest, HeartbeatResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(HEARTBEAT);
        let response = self
            .inner
            .streaming(tonic::Request::new(outbound), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}
