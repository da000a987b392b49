//! Multi-node routing convergence, simulated over in-process tables.
//!
//! Three fully meshed nodes exchange announcements until each reaches
//! the other two at metric 1; severing one link forces traffic onto the
//! two-hop detour within one announcement round.

use std::collections::HashMap;

use genesis_mesh_mesh::{Announcer, RoutingTable, RoutingTableConfig};
use genesis_mesh_transport::{Message, RouteAdvert};

struct SimNode {
    id: String,
    announcer: Announcer,
    table: RoutingTable,
}

impl SimNode {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            announcer: Announcer::new(id.to_string()),
            table: RoutingTable::new(id.to_string(), RoutingTableConfig::default()),
        }
    }
}

struct Sim {
    nodes: HashMap<String, SimNode>,
    links: Vec<(String, String)>,
}

impl Sim {
    fn new(ids: &[&str]) -> Self {
        Self {
            nodes: ids.iter().map(|id| (id.to_string(), SimNode::new(id))).collect(),
            links: Vec::new(),
        }
    }

    fn connect(&mut self, a: &str, b: &str, now: u64) {
        self.links.push((a.to_string(), b.to_string()));
        self.node_mut(a).table.add_neighbor(&b.to_string(), now);
        self.node_mut(b).table.add_neighbor(&a.to_string(), now);
    }

    fn disconnect(&mut self, a: &str, b: &str, now: u64) {
        self.links
            .retain(|(x, y)| !((x == a && y == b) || (x == b && y == a)));

        // Each side invalidates routes through the lost neighbor and
        // floods the withdrawals to its remaining neighbors.
        for (side, lost) in [(a, b), (b, a)] {
            let withdrawals = self
                .node_mut(side)
                .table
                .remove_neighbor(&lost.to_string(), now);
            let neighbors = self.neighbors_of(side);
            for neighbor in neighbors {
                let announcer = Announcer::new(neighbor.clone());
                let node = self.node_mut(&neighbor);
                announcer.handle_withdrawals(
                    &mut node.table,
                    &side.to_string(),
                    &withdrawals,
                    now,
                );
            }
        }
    }

    fn neighbors_of(&self, id: &str) -> Vec<String> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn node_mut(&mut self, id: &str) -> &mut SimNode {
        self.nodes.get_mut(id).expect("node exists")
    }

    /// One announcement round: every node builds its full-table
    /// announcement and every neighbor applies it.
    fn announce_round(&mut self, now: u64) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        let mut announcements: HashMap<String, Vec<RouteAdvert>> = HashMap::new();

        for id in &ids {
            let node = self.node_mut(id);
            let message = node.announcer.build_announcement(&mut node.table, now);
            if let Message::RouteAnnounce { routes } = message {
                announcements.insert(id.clone(), routes);
            }
        }

        for (sender, routes) in &announcements {
            for receiver in self.neighbors_of(sender) {
                let node = self.node_mut(&receiver);
                let announcer = Announcer::new(node.id.clone());
                announcer.handle_announce(&mut node.table, sender, routes, now);
            }
        }
    }

    fn metric(&self, from: &str, to: &str) -> Option<u8> {
        self.nodes[from].table.get(&to.to_string()).and_then(|entry| {
            if entry.state == genesis_mesh_mesh::RouteState::Active {
                Some(entry.metric)
            } else {
                None
            }
        })
    }

    fn next_hop(&self, from: &str, to: &str, now: u64) -> Option<String> {
        self.nodes[from].table.next_hop(&to.to_string(), now).cloned()
    }
}

#[test]
fn triangle_converges_to_direct_routes() {
    let mut sim = Sim::new(&["alpha", "bravo", "charlie"]);
    sim.connect("alpha", "bravo", 0);
    sim.connect("bravo", "charlie", 0);
    sim.connect("alpha", "charlie", 0);

    // Two rounds are enough for a full mesh of three.
    sim.announce_round(1_000);
    sim.announce_round(2_000);

    for from in ["alpha", "bravo", "charlie"] {
        for to in ["alpha", "bravo", "charlie"] {
            if from == to {
                continue;
            }
            assert_eq!(sim.metric(from, to), Some(1), "{} -> {}", from, to);
            assert_eq!(
                sim.next_hop(from, to, 2_000),
                Some(to.to_string()),
                "{} -> {}",
                from,
                to
            );
        }
    }
}

#[test]
fn severed_link_reroutes_through_third_node() {
    let mut sim = Sim::new(&["alpha", "bravo", "charlie"]);
    sim.connect("alpha", "bravo", 0);
    sim.connect("bravo", "charlie", 0);
    sim.connect("alpha", "charlie", 0);

    sim.announce_round(1_000);
    sim.announce_round(2_000);

    // Sever alpha <-> bravo. Both lose the direct route immediately.
    sim.disconnect("alpha", "bravo", 3_000);
    assert_eq!(sim.next_hop("bravo", "alpha", 3_000), None);
    assert_eq!(sim.next_hop("alpha", "bravo", 3_000), None);

    // One further round restores reachability through charlie, with the
    // detour metric.
    sim.announce_round(4_000);
    assert_eq!(
        sim.next_hop("bravo", "alpha", 4_000),
        Some("charlie".to_string())
    );
    assert_eq!(sim.metric("bravo", "alpha"), Some(2));
    assert_eq!(
        sim.next_hop("alpha", "bravo", 4_000),
        Some("charlie".to_string())
    );
    assert_eq!(sim.metric("alpha", "bravo"), Some(2));

    // Charlie keeps its direct routes to both.
    assert_eq!(sim.metric("charlie", "alpha"), Some(1));
    assert_eq!(sim.metric("charlie", "bravo"), Some(1));
}

#[test]
fn stable_sequences_do_not_flap_routes() {
    let mut sim = Sim::new(&["alpha", "bravo", "charlie"]);
    sim.connect("alpha", "bravo", 0);
    sim.connect("bravo", "charlie", 0);
    sim.connect("alpha", "charlie", 0);

    for round in 1..8u64 {
        sim.announce_round(round * 1_000);
    }

    // After convergence, repeated rounds leave next hops unchanged.
    let before: Vec<Option<String>> = vec![
        sim.next_hop("alpha", "bravo", 8_000),
        sim.next_hop("bravo", "charlie", 8_000),
        sim.next_hop("charlie", "alpha", 8_000),
    ];
    sim.announce_round(9_000);
    let after = vec![
        sim.next_hop("alpha", "bravo", 9_000),
        sim.next_hop("bravo", "charlie", 9_000),
        sim.next_hop("charlie", "alpha", 9_000),
    ];
    assert_eq!(before, after);
}
