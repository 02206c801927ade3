use rand::{thread_rng, Rng};
use std::collections::HashSet;
use tokio::task::yield_now;
use tokio::time::{sleep, Duration};

/// Full-mesh link table between cluster nodes; a partition is a set of cut links.
#[derive(Clone, Debug)]
pub struct LinkTable {
    node_count: usize,
    // Stored as (min, max) so each undirected link has one entry
    cut: HashSet<(usize, usize)>,
}

fn link(a: usize, b: usize) -> (usize, usize) {
    if a <= b { (a, b) } else { (b, a) }
}

impl LinkTable {
    pub fn new(node_count: usize) -> Self {
        LinkTable { node_count, cut: HashSet::new() }
    }

    pub fn connected(&self, a: usize, b: usize) -> bool {
        a == b || !self.cut.contains(&link(a, b))
    }

    pub fn cut(&mut self, a: usize, b: usize) {
        if a != b {
            self.cut.insert(link(a, b));
        }
    }

    pub fn restore(&mut self, a: usize, b: usize) {
        self.cut.remove(&link(a, b));
    }

    /// Cuts every link of `node`.
    pub fn isolate(&mut self, node: usize) {
        for peer in 0..self.node_count {
            self.cut(node, peer);
        }
    }

    /// Restores every link of `node`.
    pub fn heal(&mut self, node: usize) {
        for peer in 0..self.node_count {
            self.restore(node, peer);
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !self.cut.is_empty()
    }
}

/// Uniform round-trip delay in `[min_ms, max_ms]`.
#[derive(Clone, Copy, Debug)]
pub struct LatencyModel {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyModel {
    pub fn sample(&self) -> Duration {
        let delay_ms = if self.min_ms >= self.max_ms {
            self.min_ms
        } else {
            thread_rng().gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(delay_ms)
    }

    pub async fn delay(&self) {
        let d = self.sample();
        if d.is_zero() {
            // zero delay is still a suspension point
            yield_now().await;
        } else {
            sleep(d).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_and_heal() {
        let mut links = LinkTable::new(3);
        assert!(links.connected(0, 2));
        links.isolate(2);
        assert!(!links.connected(0, 2));
        assert!(!links.connected(2, 1));
        assert!(links.connected(0, 1));
        assert!(links.connected(2, 2));
        links.heal(2);
        assert!(!links.is_partitioned());
    }

    #[test]
    fn cut_is_undirected() {
        let mut links = LinkTable::new(3);
        links.cut(2, 1);
        assert!(!links.connected(1, 2));
        links.restore(1, 2);
        assert!(links.connected(2, 1));
    }

    #[test]
    fn latency_stays_in_range() {
        let model = LatencyModel { min_ms: 3, max_ms: 7 };
        for _ in 0..100 {
            let d = model.sample();
            assert!(d >= Duration::from_millis(3) && d <= Duration::from_millis(7), "{:?}", d);
        }
        let fixed = LatencyModel { min_ms: 4, max_ms: 1 };
        assert_eq!(fixed.sample(), Duration::from_millis(4));
    }
}
