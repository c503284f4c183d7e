use crate::rtp_stream::MediaPacket;
use bytes::Bytes;

/// Decision of an encoding context about one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadAction {
    /// Forward with the original payload.
    Forward,
    /// Forward with a rewritten payload (e.g. renumbered picture ids).
    Rewrite(Bytes),
    /// Do not forward; the output sequence skips the packet.
    Drop,
}

/// Per-codec layer filter and payload rewriter.
///
/// Owns the target and current layers *inside* the encoding of the source
/// being forwarded. Implementations that understand a codec's payload
/// descriptor can rewrite it; the default [`LayeredEncodingContext`] relies on
/// the layer metadata attached to each [`MediaPacket`].
pub trait EncodingContext {
    fn target_spatial_layer(&self) -> i16;
    fn target_temporal_layer(&self) -> i16;
    fn current_spatial_layer(&self) -> i16;
    fn current_temporal_layer(&self) -> i16;

    fn set_target_spatial_layer(&mut self, layer: i16);
    fn set_target_temporal_layer(&mut self, layer: i16);
    fn set_current_spatial_layer(&mut self, layer: i16);
    fn set_current_temporal_layer(&mut self, layer: i16);

    /// The output stream was re-synchronized; forget codec continuity state.
    fn sync_required(&mut self);

    fn process_packet(&mut self, packet: &MediaPacket) -> PayloadAction;
}

/// Encoding context driven by packet layer metadata.
///
/// Temporal layers above the target are dropped; the current temporal layer
/// follows the highest forwarded one. With more than one spatial layer, an
/// upgrade happens on a key frame of the target layer and a downgrade at once;
/// packets of spatial layers above the current one are dropped.
#[derive(Debug, Clone)]
pub struct LayeredEncodingContext {
    spatial_layers: u8,
    temporal_layers: u8,
    target_spatial: i16,
    target_temporal: i16,
    current_spatial: i16,
    current_temporal: i16,
    sync_pending: bool,
}

impl LayeredEncodingContext {
    pub fn new(spatial_layers: u8, temporal_layers: u8) -> Self {
        Self {
            spatial_layers: spatial_layers.max(1),
            temporal_layers: temporal_layers.max(1),
            target_spatial: -1,
            target_temporal: -1,
            current_spatial: -1,
            current_temporal: -1,
            sync_pending: false,
        }
    }

    fn is_svc(&self) -> bool {
        self.spatial_layers > 1
    }
}

impl EncodingContext for LayeredEncodingContext {
    fn target_spatial_layer(&self) -> i16 {
        self.target_spatial
    }

    fn target_temporal_layer(&self) -> i16 {
        self.target_temporal
    }

    fn current_spatial_layer(&self) -> i16 {
        self.current_spatial
    }

    fn current_temporal_layer(&self) -> i16 {
        self.current_temporal
    }

    fn set_target_spatial_layer(&mut self, layer: i16) {
        self.target_spatial = layer;
    }

    fn set_target_temporal_layer(&mut self, layer: i16) {
        self.target_temporal = layer;
    }

    fn set_current_spatial_layer(&mut self, layer: i16) {
        self.current_spatial = layer;
    }

    fn set_current_temporal_layer(&mut self, layer: i16) {
        self.current_temporal = layer;
    }

    fn sync_required(&mut self) {
        self.sync_pending = true;
    }

    fn process_packet(&mut self, packet: &MediaPacket) -> PayloadAction {
        if self.target_temporal < 0 {
            return PayloadAction::Drop;
        }

        if self.is_svc() {
            if self.target_spatial < 0 {
                return PayloadAction::Drop;
            }
            if self.target_spatial > self.current_spatial {
                if packet.key_frame && packet.spatial_layer as i16 <= self.target_spatial {
                    self.current_spatial = self.target_spatial;
                }
            } else if self.target_spatial < self.current_spatial {
                self.current_spatial = self.target_spatial;
            }
            if self.current_spatial < 0 || packet.spatial_layer as i16 > self.current_spatial {
                return PayloadAction::Drop;
            }
        }

        let temporal = packet.temporal_layer as i16;
        if temporal > self.target_temporal {
            return PayloadAction::Drop;
        }

        if self.sync_pending {
            self.sync_pending = false;
            self.current_temporal = temporal;
        } else if temporal > self.current_temporal {
            self.current_temporal = temporal;
        }
        if self.current_temporal > self.target_temporal {
            self.current_temporal = self.target_temporal;
        }

        PayloadAction::Forward
    }
}
