//! Topology of the component graph, as established by ROUTE and UNROUTE.
//!
//! Data never flows through this structure; components exchange buffers by
//! message. The runtime keeps it in step with every successful route so the
//! graph can be inspected, validated and ordered.

use hashbrown::HashMap;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::message::{Address, ComponentId};

/// Edge weight: (output port on the source, input port on the sink).
type Ports = (u8, u8);

#[derive(Debug, Default)]
pub struct Topology {
    graph: StableGraph<ComponentId, Ports>,
    nodes: HashMap<ComponentId, NodeIndex>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: ComponentId) {
        if self.nodes.contains_key(&id) {
            return;
        }
        let idx = self.graph.add_node(id);
        self.nodes.insert(id, idx);
    }

    /// Drop a component together with every edge touching it.
    pub fn remove_node(&mut self, id: ComponentId) -> bool {
        match self.nodes.remove(&id) {
            Some(idx) => self.graph.remove_node(idx).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn index(&self, id: ComponentId) -> Result<NodeIndex> {
        self.nodes.get(&id).copied().ok_or(Error::UnknownComponent(id))
    }

    /// Record the edge `from -> to`. Edges to a host endpoint are not part of
    /// the graph and are ignored.
    pub fn connect(&mut self, from: Address, to: Address) -> Result<bool> {
        if to.id.is_client() {
            return Ok(false);
        }
        let a = self.index(from.id)?;
        let b = self.index(to.id)?;
        if self.edge_from(from).is_some() {
            return Err(Error::AlreadyRouted(from.port));
        }
        self.graph.add_edge(a, b, (from.port, to.port));
        Ok(true)
    }

    /// Remove the edge leaving output `from`, if any.
    pub fn disconnect(&mut self, from: Address) -> bool {
        match self.edge_from(from) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    fn edge_from(&self, from: Address) -> Option<EdgeIndex> {
        let idx = *self.nodes.get(&from.id)?;
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .find(|e| e.weight().0 == from.port)
            .map(|e| e.id())
    }

    /// `(output port, peer input)` for every edge leaving `id`.
    pub fn downstream(&self, id: ComponentId) -> Vec<(u8, Address)> {
        let Some(&idx) = self.nodes.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| {
                let (out, input) = *e.weight();
                (out, self.graph[e.target()].port(input))
            })
            .collect();
        edges.sort_by_key(|(port, _)| *port);
        edges
    }

    /// `(input port, peer output)` for every edge entering `id`.
    pub fn upstream(&self, id: ComponentId) -> Vec<(u8, Address)> {
        let Some(&idx) = self.nodes.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| {
                let (out, input) = *e.weight();
                (input, self.graph[e.source()].port(out))
            })
            .collect();
        edges.sort_by_key(|(port, _)| *port);
        edges
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Components ordered so that every producer precedes its consumers.
    pub fn processing_order(&self) -> Result<Vec<ComponentId>> {
        let order = toposort(&self.graph, None).map_err(|_| Error::InvalidState("graph has a cycle"))?;
        Ok(order.into_iter().map(|idx| self.graph[idx]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u16) -> ComponentId {
        ComponentId::new(0, n)
    }

    fn chain() -> Topology {
        let mut t = Topology::new();
        for n in 1..=3 {
            t.add_node(id(n));
        }
        t.connect(id(1).port(1), id(2).port(0)).unwrap();
        t.connect(id(2).port(1), id(3).port(0)).unwrap();
        t
    }

    #[test]
    fn chain_orders_producers_first() {
        let t = chain();
        assert_eq!(t.processing_order().unwrap(), vec![id(1), id(2), id(3)]);
        assert_eq!(t.downstream(id(2)), vec![(1, id(3).port(0))]);
        assert_eq!(t.upstream(id(2)), vec![(0, id(1).port(1))]);
    }

    #[test]
    fn one_edge_per_output() {
        let mut t = chain();
        let err = t.connect(id(1).port(1), id(3).port(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyRouted(1)));
        assert!(t.disconnect(id(1).port(1)));
        assert!(!t.disconnect(id(1).port(1)));
        assert_eq!(t.edge_count(), 1);
    }

    #[test]
    fn removing_a_node_drops_its_edges() {
        let mut t = chain();
        assert!(t.remove_node(id(2)));
        assert_eq!(t.edge_count(), 0);
        assert!(t.downstream(id(1)).is_empty());
        assert!(matches!(t.connect(id(2).port(1), id(3).port(0)), Err(Error::UnknownComponent(_))));
    }

    #[test]
    fn cycles_are_detected() {
        let mut t = chain();
        t.connect(id(3).port(1), id(1).port(0)).unwrap();
        assert!(t.has_cycle());
        assert!(t.processing_order().is_err());
    }

    #[test]
    fn host_edges_are_ignored() {
        let mut t = chain();
        assert!(!t.connect(id(3).port(1), Address::client(0)).unwrap());
        assert_eq!(t.edge_count(), 2);
    }
}
