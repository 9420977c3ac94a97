//! Device-side fan-out: maps a decided destination set onto sink
//! attachments, coalescing destinations that share a sink into one
//! multi-destination DataProto packet.

use crate::consts::DATAPROTO_MAX_PEER_IDS;
use crate::PeerId;

/// One packet to enqueue: the flow of `lead` carries a packet addressed to
/// `dests`, all of which are reachable through the same sink.
#[derive(Debug, PartialEq, Eq)]
pub struct RouteGroup {
    pub lead: PeerId,
    pub dests: Vec<PeerId>,
}

/// Groups destinations by the sink their local flow is attached to.
/// `attachment` resolves a destination to its sink owner. An unattached
/// destination (no link, no relay yet) gets a group of its own: the packet
/// buffers in its flow and drains once the flow attaches somewhere.
pub fn group_destinations(
    dests: &[PeerId],
    attachment: impl Fn(PeerId) -> Option<PeerId>,
) -> Vec<RouteGroup> {
    let mut groups: Vec<(Option<PeerId>, RouteGroup)> = Vec::new();
    for &dest in dests {
        let sink_owner = attachment(dest);
        let shared = sink_owner.and_then(|owner| {
            groups
                .iter_mut()
                .find(|(o, g)| *o == Some(owner) && g.dests.len() < DATAPROTO_MAX_PEER_IDS)
                .map(|(_, g)| g)
        });
        match shared {
            Some(group) => group.dests.push(dest),
            None => {
                groups.push((sink_owner, RouteGroup { lead: dest, dests: vec![dest] }));
            }
        }
    }
    groups.into_iter().map(|(_, g)| g).collect()
}
