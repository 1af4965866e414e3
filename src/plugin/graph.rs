//! Plugin dependency ordering.
//!
//! Strongly connected components (Tarjan) give both the start order and the
//! cycles in one pass: components are emitted dependencies-first, and any
//! component with more than one member (or a self-edge) is a cycle.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
    self_edges: BTreeSet<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GraphOrder {
    /// Every node, dependencies before dependents. Ties keep insertion order.
    pub order: Vec<String>,
    /// Each cycle's members, in insertion order.
    pub cycles: Vec<Vec<String>>,
}

impl GraphOrder {
    pub fn in_cycle(&self, name: &str) -> Option<&[String]> {
        self.cycles
            .iter()
            .find(|cycle| cycle.iter().any(|n| n == name))
            .map(Vec::as_slice)
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), i);
        self.edges.push(Vec::new());
        i
    }

    /// `from` depends on `to`. Edges to unknown nodes are ignored, so add
    /// every node first.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if f == t {
            self.self_edges.insert(f);
        } else if !self.edges[f].contains(&t) {
            self.edges[f].push(t);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn order(&self) -> GraphOrder {
        let mut tarjan = Tarjan::new(self.nodes.len());
        for v in 0..self.nodes.len() {
            if tarjan.index[v].is_none() {
                tarjan.connect(v, &self.edges);
            }
        }

        let mut result = GraphOrder::default();
        for mut component in tarjan.components {
            component.sort_unstable();
            let cyclic = component.len() > 1 || self.self_edges.contains(&component[0]);
            let names: Vec<String> = component.iter().map(|&i| self.nodes[i].clone()).collect();
            if cyclic {
                result.cycles.push(names.clone());
            }
            result.order.extend(names);
        }
        result
    }
}

struct Tarjan {
    next: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            next: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn connect(&mut self, v: usize, edges: &[Vec<usize>]) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in &edges[v] {
            match self.index[w] {
                None => {
                    self.connect(w, edges);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(wi) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(wi);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
