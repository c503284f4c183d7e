use crate::consumer::Consumer;
use log::debug;
use std::time::Instant;

/// What the distributor needs from a consumer.
pub trait LayerAllocator {
    fn allocator_id(&self) -> &str;

    /// 0 opts out of the distribution.
    fn bitrate_priority(&self) -> u16;

    /// Picks provisional layers fitting `bitrate`, returns the bitrate claimed.
    fn use_available_bitrate(&mut self, now: Instant, bitrate: u32) -> u32;

    /// Upgrades the provisional layers by one step if affordable, returns the
    /// extra bitrate claimed.
    fn increase_layer(&mut self, now: Instant, bitrate: u32) -> u32;

    /// Commits the provisional layers.
    fn apply_layers(&mut self);
}

impl LayerAllocator for Consumer {
    fn allocator_id(&self) -> &str {
        self.id()
    }

    fn bitrate_priority(&self) -> u16 {
        self.inner().bitrate_priority()
    }

    fn use_available_bitrate(&mut self, now: Instant, bitrate: u32) -> u32 {
        self.inner_mut().use_available_bitrate(now, bitrate)
    }

    fn increase_layer(&mut self, now: Instant, bitrate: u32) -> u32 {
        self.inner_mut().increase_layer(now, bitrate)
    }

    fn apply_layers(&mut self) {
        self.inner_mut().apply_layers()
    }
}

/// Splits `available_bitrate` across `allocators` and returns what is left.
///
/// A proportional pass offers every allocator its priority share, highest
/// priority first. While at least `min_greedy_bitrate` remains, the whole
/// remainder is then offered to each allocator in turn so it can step up one
/// layer. Layers are applied only once every allocator made its choice.
pub fn distribute(
    now: Instant,
    available_bitrate: u32,
    allocators: Vec<&mut dyn LayerAllocator>,
    min_greedy_bitrate: u32,
) -> u32 {
    let mut prioritized: Vec<(u16, &mut dyn LayerAllocator)> = allocators
        .into_iter()
        .filter_map(|allocator| {
            let priority = allocator.bitrate_priority();
            (priority > 0).then_some((priority, allocator))
        })
        .collect();

    let total_priorities: u64 = prioritized.iter().map(|(p, _)| *p as u64).sum();
    if total_priorities == 0 {
        return available_bitrate;
    }

    // Stable, so equal priorities keep their insertion order.
    prioritized.sort_by(|(a, _), (b, _)| b.cmp(a));

    debug!(
        "before iterations [availableBitrate:{}]",
        available_bitrate
    );

    let mut remaining_bitrate = available_bitrate;

    for (priority, allocator) in prioritized.iter_mut() {
        let bitrate = (available_bitrate as u64 * *priority as u64 / total_priorities) as u32;

        debug!(
            "main bitrate for consumer [priority:{}, bitrate:{}, consumerId:{}]",
            priority,
            bitrate,
            allocator.allocator_id()
        );

        let used_bitrate = allocator.use_available_bitrate(now, bitrate);
        remaining_bitrate = remaining_bitrate.saturating_sub(used_bitrate);
    }

    debug!(
        "after first main iteration [remainingBitrate:{}]",
        remaining_bitrate
    );

    'greedy: while remaining_bitrate >= min_greedy_bitrate {
        let previous_remaining_bitrate = remaining_bitrate;

        for (_, allocator) in prioritized.iter_mut() {
            debug!(
                "layer bitrate for consumer [bitrate:{}, consumerId:{}]",
                remaining_bitrate,
                allocator.allocator_id()
            );

            let used_bitrate = allocator.increase_layer(now, remaining_bitrate);
            remaining_bitrate = remaining_bitrate.saturating_sub(used_bitrate);

            if remaining_bitrate < min_greedy_bitrate {
                break 'greedy;
            }
        }

        if remaining_bitrate == previous_remaining_bitrate {
            break;
        }
    }

    debug!(
        "after layer-by-layer iteration [remainingBitrate:{}]",
        remaining_bitrate
    );

    for (_, allocator) in prioritized.iter_mut() {
        allocator.apply_layers();
    }

    remaining_bitrate
}
