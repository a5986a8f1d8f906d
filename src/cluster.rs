//! Overlap clustering for multi-label detector output.
//!
//! A multi-label detector may report the same physical object several times, once
//! per plausible class. Boxes whose IoU exceeds a threshold are linked, and every
//! connected component of that graph becomes one cluster. Linking is transitive: a
//! chain of boxes where each overlaps only its neighbour collapses into a single
//! cluster even though the ends never touch.
//!
//! Cluster ids are ordinals in discovery order. Seeds are taken in ascending input
//! order, so the cluster containing box 0 is always cluster 0, and the lowest index
//! of each cluster increases with its id.

use crate::error::InvalidBoxError;
use crate::geometry::{iou, BoundingBox};

/// Cluster id per box, or the identity mapping when multi-label mode is off.
pub fn cluster_ids(
    boxes: &[BoundingBox],
    multi_label: bool,
    threshold: f32,
) -> Result<Vec<usize>, InvalidBoxError> {
    if multi_label {
        overlap_clusters(boxes, threshold)
    } else {
        Ok((0..boxes.len()).collect())
    }
}

/// Partition `boxes` into connected components of the `iou > threshold` graph.
pub fn overlap_clusters(
    boxes: &[BoundingBox],
    threshold: f32,
) -> Result<Vec<usize>, InvalidBoxError> {
    let adjacency = build_adjacency(boxes, threshold)?;

    let mut ids: Vec<Option<usize>> = vec![None; boxes.len()];
    let mut next_id = 0;
    let mut stack = Vec::new();

    for seed in 0..boxes.len() {
        if ids[seed].is_some() {
            continue;
        }
        ids[seed] = Some(next_id);
        stack.push(seed);
        while let Some(current) = stack.pop() {
            for &neighbour in &adjacency[current] {
                if ids[neighbour].is_none() {
                    ids[neighbour] = Some(next_id);
                    stack.push(neighbour);
                }
            }
        }
        next_id += 1;
    }

    Ok(ids.into_iter().flatten().collect())
}

/// Number of distinct clusters in an id vector produced by this module.
pub fn cluster_count(ids: &[usize]) -> usize {
    ids.iter().max().map_or(0, |max| max + 1)
}

/// Index of the first member of every cluster, ordered by cluster id.
pub fn representatives(ids: &[usize]) -> Vec<usize> {
    let mut firsts: Vec<Option<usize>> = vec![None; cluster_count(ids)];
    for (index, &id) in ids.iter().enumerate() {
        firsts[id].get_or_insert(index);
    }
    firsts.into_iter().flatten().collect()
}

// Only forward pairs are scored; the edge is mirrored so traversal sees both ends.
fn build_adjacency(
    boxes: &[BoundingBox],
    threshold: f32,
) -> Result<Vec<Vec<usize>>, InvalidBoxError> {
    let mut adjacency = vec![Vec::new(); boxes.len()];
    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if iou(&boxes[i], &boxes[j])? > threshold {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }
    Ok(adjacency)
}
