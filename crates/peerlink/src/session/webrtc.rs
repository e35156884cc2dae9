//! webrtc-rs implementation of the connection seam

use super::engine::{
    CallRole, DataChannelState, IceConnectionState, RtcConnection, RtcEngine, RtcEvent,
    RtcEventSink, SdpKind, SessionDescription,
};
use crate::config::{IceServerConfig, SessionConfig};
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Builds webrtc-rs peer connections with one data channel each
pub struct WebRtcEngine {
    ice_servers: Vec<IceServerConfig>,
    config: SessionConfig,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<IceServerConfig>, config: SessionConfig) -> Self {
        Self {
            ice_servers,
            config,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        role: CallRole,
        sink: RtcEventSink,
    ) -> Result<Box<dyn RtcConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| {
                    Error::PeerConnection(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let low_threshold = self.config.high_water_mark_bytes / 2;
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        let ice_sink = sink.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let sink = ice_sink.clone();
                Box::pin(async move {
                    sink.emit(RtcEvent::IceConnectionState(map_ice_state(state)));
                })
            },
        ));

        let candidate_sink = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(session_id = %sink.session_id(), "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(RtcEvent::LocalCandidate(IceCandidate {
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        match role {
            CallRole::Caller => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.config.ordered),
                    max_retransmits: self.config.max_retransmits,
                    ..Default::default()
                };
                let data_channel = peer_connection
                    .create_data_channel(&self.config.data_channel_label, Some(init))
                    .await
                    .map_err(|e| {
                        Error::DataChannel(format!("Failed to create data channel: {}", e))
                    })?;
                wire_data_channel(&data_channel, sink.clone(), low_threshold).await;
                *channel.lock() = Some(data_channel);
            }
            CallRole::Callee => {
                let adopt_sink = sink.clone();
                let slot = channel.clone();
                peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
                    let sink = adopt_sink.clone();
                    let slot = slot.clone();
                    Box::pin(async move {
                        info!(
                            session_id = %sink.session_id(),
                            "Remote data channel announced: {}",
                            data_channel.label()
                        );
                        wire_data_channel(&data_channel, sink, low_threshold).await;
                        *slot.lock() = Some(data_channel);
                    })
                }));
            }
        }

        Ok(Box::new(WebRtcConnection {
            peer_connection,
            channel,
        }))
    }
}

async fn wire_data_channel(data_channel: &Arc<RTCDataChannel>, sink: RtcEventSink, low_threshold: usize) {
    let open_sink = sink.clone();
    data_channel.on_open(Box::new(move || {
        Box::pin(async move {
            open_sink.emit(RtcEvent::DataChannelState(DataChannelState::Open));
        })
    }));

    let close_sink = sink.clone();
    data_channel.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(RtcEvent::DataChannelState(DataChannelState::Closed));
        })
    }));

    let error_sink = sink.clone();
    data_channel.on_error(Box::new(move |err| {
        let session_id = error_sink.session_id();
        Box::pin(async move {
            error!(session_id = %session_id, "Data channel error: {}", err);
        })
    }));

    let message_sink = sink.clone();
    data_channel.on_message(Box::new(move |msg| {
        let sink = message_sink.clone();
        Box::pin(async move {
            sink.emit(RtcEvent::Message(msg.data));
        })
    }));

    data_channel.set_buffered_amount_low_threshold(low_threshold).await;
    data_channel
        .on_buffered_amount_low(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(RtcEvent::BufferedAmountLow);
            })
        }))
        .await;
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcConnection {
    fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }

    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting it".to_string()))?;
        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| Error::Sdp(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        let data_channel = self
            .data_channel()
            .ok_or_else(|| Error::DataChannel("Data channel not established".to_string()))?;

        data_channel
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannel(format!("Failed to send: {}", e)))
    }

    async fn buffered_amount(&self) -> usize {
        match self.data_channel() {
            Some(data_channel) => data_channel.buffered_amount().await,
            None => 0,
        }
    }

    async fn close(&self) -> Result<()> {
        let data_channel = self.channel.lock().take();
        if let Some(data_channel) = data_channel {
            if let Err(e) = data_channel.close().await {
                debug!("Error closing data channel: {}", e);
            }
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(map_ice_state(RTCIceConnectionState::Unspecified), IceConnectionState::New);
        assert_eq!(map_ice_state(RTCIceConnectionState::Failed), IceConnectionState::Failed);
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
    }

    #[test]
    fn test_turn_credentials_forwarded() {
        let engine = WebRtcEngine::new(
            vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::turn("turn:turn.example.com:3478", "user", "pass"),
            ],
            SessionConfig::default(),
        );
        let config = engine.rtc_configuration();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "user");
        assert_eq!(config.ice_servers[1].credential, "pass");
        assert!(config.ice_servers[0].username.is_empty());
    }

    #[tokio::test]
    async fn test_caller_offer_contains_data_channel() {
        let engine = WebRtcEngine::new(Vec::new(), SessionConfig::default());
        let sink = RtcEventSink::new(SessionId::new(1), |_, _| true);
        let connection = engine.create_connection(CallRole::Caller, sink).await.unwrap();

        let offer = connection.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=application"));
        connection.close().await.unwrap();
    }
}
