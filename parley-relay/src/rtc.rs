//! WebRTC-backed session transport.
//!
//! Each participant gets one peer connection. Inbound audio is pumped
//! from the remote track into a broadcast channel; forwarding into
//! another participant adds a local track fed from that channel.

use async_trait::async_trait;
use parley_core::config::RelayConfig;
use parley_core::{Error, Result, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::transport::{
    SessionEvent, SessionState, SessionTransport, TransportEvent, TransportFactory,
};

/// Buffered RTP packets per feed; slow subscribers lag past this.
const AUDIO_CHANNEL_CAPACITY: usize = 512;

/// A participant's live audio feed: the negotiated codec plus the packet
/// stream every other session subscribes to.
#[derive(Clone)]
pub struct AudioFeed {
    codec: RTCRtpCodecCapability,
    packets: tokio::sync::broadcast::Sender<Packet>,
}

/// Builds [`RtcTransport`]s from the relay configuration.
pub struct RtcFactory {
    config: RelayConfig,
}

impl RtcFactory {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    async fn build_peer_connection(&self) -> Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    type Transport = RtcTransport;

    async fn open(
        &self,
        user_id: UserId,
        events: mpsc::Sender<SessionEvent<AudioFeed>>,
    ) -> Result<Arc<RtcTransport>> {
        let pc = Arc::new(self.build_peer_connection().await?);
        let cancel = CancellationToken::new();

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => SessionState::New,
                    RTCPeerConnectionState::Connecting => SessionState::Connecting,
                    RTCPeerConnectionState::Connected => SessionState::Connected,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        SessionState::Failed
                    }
                    RTCPeerConnectionState::Closed => SessionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                if events
                    .send(SessionEvent {
                        user_id,
                        event: TransportEvent::StateChanged(mapped),
                    })
                    .await
                    .is_err()
                {
                    debug!(user_id = %user_id, "worker gone, dropping state change");
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let events = track_events.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(user_id = %user_id, kind = %track.kind(), "ignoring non-audio track");
                    return;
                }
                let codec = track.codec().capability;
                let (packets, _) = tokio::sync::broadcast::channel(AUDIO_CHANNEL_CAPACITY);
                let feed = AudioFeed {
                    codec,
                    packets: packets.clone(),
                };
                if events
                    .send(SessionEvent {
                        user_id,
                        event: TransportEvent::AudioArrived(feed),
                    })
                    .await
                    .is_err()
                {
                    debug!(user_id = %user_id, "worker gone, dropping audio feed");
                    return;
                }
                // Pump RTP into the feed until the track ends. Subscriber
                // count may be zero; those packets are simply dropped.
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                let _ = packets.send(packet);
                            }
                            Err(e) => {
                                debug!(user_id = %user_id, error = %e, "audio track ended");
                                break;
                            }
                        }
                    }
                });
            })
        }));

        Ok(Arc::new(RtcTransport {
            user_id,
            pc,
            cancel,
            gathering_timeout: Duration::from_secs(self.config.ice_gathering_timeout_seconds),
        }))
    }
}

/// One participant's peer connection.
pub struct RtcTransport {
    user_id: UserId,
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
    gathering_timeout: Duration,
}

#[async_trait]
impl SessionTransport for RtcTransport {
    type Audio = AudioFeed;

    async fn apply_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        // Wait for ICE gathering so the answer carries its candidates;
        // trickle is not part of the signaling protocol.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if timeout(self.gathering_timeout, gathered.recv())
            .await
            .is_err()
        {
            warn!(user_id = %self.user_id, "ice gathering timed out, answering with partial candidates");
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Transport("no local description after answer".to_string()))?;
        Ok(local.sdp)
    }

    async fn forward(&self, from: UserId, source: &AudioFeed) -> Result<()> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            source.codec.clone(),
            format!("audio-{from}"),
            format!("parley-{from}"),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        // Drain RTCP from the sender so interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let mut packets = source.packets.subscribe();
        let cancel = self.cancel.clone();
        let to = self.user_id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = packets.recv() => match received {
                        Ok(packet) => {
                            if let Err(e) = track.write_rtp(&packet).await {
                                debug!(from = %from, to = %to, error = %e, "fan-out write failed, stopping");
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(from = %from, to = %to, skipped, "fan-out lagging, dropped packets");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(user_id = %self.user_id, error = %e, "peer connection close failed");
        }
    }
}
