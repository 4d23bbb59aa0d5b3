//! RainTree broadcast fan-out.
//!
//! Given a self-anchored sorted peer list (self at index 0), every level of
//! the tree picks two targets inside a circular window that starts at self
//! and shrinks by [`SHRINK_FACTOR`] per level. Each target receives the
//! message tagged with the next level down and repeats the process from its
//! own position, so the message reaches all `N` peers in `O(log3 N)` hops.
//!
//! Everything here is pure: no I/O, no shared state.

/// Target window shrink factor per level.
pub const SHRINK_FACTOR: f64 = 0.66;

/// Divisor locating the left target inside the window.
const LEFT_DIVISOR: f64 = 1.5;

/// Divisor locating the right target inside the window.
const RIGHT_DIVISOR: f64 = 3.0;

/// Round to two decimal places, halves away from zero.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Number of levels needed to cover `n` peers. Level 0 is terminal.
pub fn top_level(n: usize) -> u32 {
    if n == 0 {
        return 0;
    }
    let log3 = (n as f64).ln() / 3f64.ln();
    round2(log3).ceil() as u32 + 1
}

/// Size of the target window at `current_level`.
pub fn target_list_size(n: usize, top_level: u32, current_level: u32) -> usize {
    let depth = top_level.saturating_sub(current_level) as i32;
    (n as f64 * SHRINK_FACTOR.powi(depth)).round() as usize
}

/// Circular window of `size` elements starting at `self_position`.
pub fn target_list<T: Clone>(list: &[T], self_position: usize, size: usize) -> Vec<T> {
    if list.is_empty() {
        return Vec::new();
    }
    list.iter()
        .cycle()
        .skip(self_position % list.len())
        .take(size.min(list.len()))
        .cloned()
        .collect()
}

/// Fixed position inside a window of `size` elements.
///
/// The 1-based candidate `round(self + size / divisor) + 1` is reflected
/// back from the end when it overshoots, then rolled into `1..=size`.
fn pick(self_position: usize, size: usize, divisor: f64) -> usize {
    if size == 0 {
        return 0;
    }
    let size = size as i64;
    let mut p = (self_position as f64 + size as f64 / divisor).round() as i64 + 1;

    if p > size {
        p = size + 1 - (p - size);
    }
    while p < 1 {
        p += size;
    }
    while p > size {
        p -= size;
    }

    (p - 1) as usize
}

/// Index of the left target inside a window of `size` elements.
pub fn pick_left(self_position: usize, size: usize) -> usize {
    pick(self_position, size, LEFT_DIVISOR)
}

/// Index of the right target inside a window of `size` elements.
pub fn pick_right(self_position: usize, size: usize) -> usize {
    pick(self_position, size, RIGHT_DIVISOR)
}

/// One fan-out step: send to `left` and `right`, tagging the message with `level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop<T> {
    /// The node performing the step (index 0 of the list).
    pub origin: T,
    /// First target.
    pub left: T,
    /// Second target.
    pub right: T,
    /// Level the targets resume from.
    pub level: u32,
}

/// RainTree over a self-anchored sorted list.
#[derive(Debug, Clone, Copy)]
pub struct RainTree<'a, T> {
    peers: &'a [T],
}

impl<'a, T: Clone> RainTree<'a, T> {
    /// Wrap a list whose first element is the local node.
    pub fn new(peers: &'a [T]) -> Self {
        Self { peers }
    }

    /// Number of peers in the tree.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the tree has no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Levels needed for this list.
    pub fn top_level(&self) -> u32 {
        top_level(self.peers.len())
    }

    /// Fan-out steps, outermost level first.
    ///
    /// The root starts at the top level; a relaying node resumes from the
    /// level carried in the message it received.
    pub fn hops(&self, is_root: bool, from_level: u32) -> Vec<Hop<T>> {
        let n = self.peers.len();
        if n == 0 {
            return Vec::new();
        }

        let top = self.top_level();
        let mut current = if is_root { top } else { from_level.min(top) };
        let mut hops = Vec::with_capacity(current as usize);

        while current > 0 {
            let size = target_list_size(n, top, current).max(1);
            let window = target_list(self.peers, 0, size);
            let left = pick_left(0, window.len());
            let right = pick_right(0, window.len());

            hops.push(Hop {
                origin: self.peers[0].clone(),
                left: window[left].clone(),
                right: window[right].clone(),
                level: current - 1,
            });
            current -= 1;
        }

        hops
    }

    /// Run `act` for each fan-out step, stopping at the first error.
    pub fn traverse<E, F>(&self, is_root: bool, from_level: u32, mut act: F) -> Result<(), E>
    where
        F: FnMut(&Hop<T>) -> Result<(), E>,
    {
        for hop in self.hops(is_root, from_level) {
            act(&hop)?;
        }
        Ok(())
    }
}
