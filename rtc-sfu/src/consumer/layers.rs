use serde::{Deserialize, Serialize};

/// Layers reported to and requested by the application.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

/// Spatial/temporal pair in the `-1..N-1` index space, `-1` meaning none.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Layers {
    pub(crate) spatial: i16,
    pub(crate) temporal: i16,
}

impl Default for Layers {
    fn default() -> Self {
        Self::NONE
    }
}

impl Layers {
    pub(crate) const NONE: Layers = Layers {
        spatial: -1,
        temporal: -1,
    };

    pub(crate) fn new(spatial: i16, temporal: i16) -> Self {
        Self { spatial, temporal }
    }

    pub(crate) fn is_none(&self) -> bool {
        self.spatial == -1
    }

    /// Preferred layers clamped to what the encoding advertises; absent
    /// preferences select the highest layers.
    pub(crate) fn preferred(
        preferred: Option<ConsumerLayers>,
        spatial_layers: u8,
        temporal_layers: u8,
    ) -> Self {
        let max_spatial = spatial_layers.max(1) as i16 - 1;
        let max_temporal = temporal_layers.max(1) as i16 - 1;
        match preferred {
            Some(layers) => Layers {
                spatial: (layers.spatial_layer as i16).min(max_spatial),
                temporal: layers
                    .temporal_layer
                    .map(|t| (t as i16).min(max_temporal))
                    .unwrap_or(max_temporal),
            },
            None => Layers {
                spatial: max_spatial,
                temporal: max_temporal,
            },
        }
    }
}

impl From<Layers> for Option<ConsumerLayers> {
    fn from(layers: Layers) -> Self {
        if layers.spatial < 0 {
            return None;
        }
        Some(ConsumerLayers {
            spatial_layer: layers.spatial as u8,
            temporal_layer: (layers.temporal >= 0).then_some(layers.temporal as u8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_layers() {
        let tests = vec![
            ("absent", None, 3, 3, Layers::new(2, 2)),
            (
                "clamped",
                Some(ConsumerLayers {
                    spatial_layer: 5,
                    temporal_layer: Some(7),
                }),
                3,
                2,
                Layers::new(2, 1),
            ),
            (
                "no temporal",
                Some(ConsumerLayers {
                    spatial_layer: 1,
                    temporal_layer: None,
                }),
                3,
                3,
                Layers::new(1, 2),
            ),
        ];

        for (name, preferred, spatial_layers, temporal_layers, expected) in tests {
            assert_eq!(
                Layers::preferred(preferred, spatial_layers, temporal_layers),
                expected,
                "{name} failed"
            );
        }
    }

    #[test]
    fn test_layers_into_consumer_layers() {
        assert_eq!(Option::<ConsumerLayers>::from(Layers::NONE), None);
        assert_eq!(
            Option::<ConsumerLayers>::from(Layers::new(1, -1)),
            Some(ConsumerLayers {
                spatial_layer: 1,
                temporal_layer: None
            })
        );
    }
}
