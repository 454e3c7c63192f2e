//! Ordering of graph nodes. Nodes are addressed by their registration index, edges are given as one output list per node.

///Fixed size flag array over node indices.
pub(crate) struct FlagSet {
    words: Vec<u64>,
}

impl FlagSet {
    pub(crate) fn new(count: usize) -> Self {
        FlagSet {
            words: vec![0; count.div_ceil(64)],
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    pub(crate) fn clear(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SortError {
    ///`node` was reached again while it was still being visited.
    Cycle { node: usize },
}

///Depth first topological sort.
///
/// Roots and outputs are visited in reverse registration order, which makes the reversed post-order keep unrelated nodes
/// in registration order. The traversal uses an explicit stack, so the depth of the graph is not bound by the thread's stack.
pub(crate) fn depth_first(outputs: &[Vec<usize>]) -> Result<Vec<usize>, SortError> {
    let count = outputs.len();
    let mut open = FlagSet::new(count);
    let mut finished = FlagSet::new(count);
    let mut post_order = Vec::with_capacity(count);
    //(node, number of already visited outputs)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in (0..count).rev() {
        if finished.get(root) {
            continue;
        }

        open.set(root);
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            let outs = &outputs[node];
            if cursor < outs.len() {
                top.1 += 1;
                let next = outs[outs.len() - 1 - cursor];
                if open.get(next) {
                    return Err(SortError::Cycle { node: next });
                }
                if !finished.get(next) {
                    open.set(next);
                    stack.push((next, 0));
                }
            } else {
                stack.pop();
                open.clear(node);
                finished.set(node);
                post_order.push(node);
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}

///Breadth first layering, starting at all nodes without inputs. Each layer is sorted by registration index.
///
/// Returns the layers. Nodes that can't be reached because they sit on, or behind a cycle are reported as error.
pub(crate) fn breadth_first(outputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>, SortError> {
    let count = outputs.len();
    let mut in_degree = vec![0usize; count];
    for outs in outputs {
        for out in outs {
            in_degree[*out] += 1;
        }
    }

    let mut layers = Vec::new();
    let mut current: Vec<usize> = (0..count).filter(|n| in_degree[*n] == 0).collect();
    let mut placed = FlagSet::new(count);
    let mut placed_count = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for node in current.iter() {
            placed.set(*node);
            placed_count += 1;
            for out in outputs[*node].iter() {
                in_degree[*out] -= 1;
                if in_degree[*out] == 0 {
                    next.push(*out);
                }
            }
        }
        next.sort_unstable();
        layers.push(current);
        current = next;
    }

    if placed_count < count {
        let node = (0..count).find(|n| !placed.get(*n)).unwrap_or(0);
        return Err(SortError::Cycle { node });
    }

    Ok(layers)
}
