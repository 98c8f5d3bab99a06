//! 最近邻轨迹链接 (Nearest-neighbour trajectory linking)
//!
//! 每帧:
//! 1. 丢弃超出 memory 的轨迹
//! 2. 预测轨迹位置 (可选速度外推)
//! 3. 收集 search-range 内的候选对; 子网过大时按 adaptive-step 缩小搜索半径
//! 4. 按距离贪心匹配, 未匹配特征开启新轨迹

use std::collections::HashMap;

use super::{Feature, TrajectoryLinker};
use crate::config::LinkConfig;
use crate::error::{Error, Result};

/// Subnetworks with more members than this trigger adaptive search.
pub const DEFAULT_MAX_SUBNET_SIZE: usize = 30;

#[derive(Debug, Clone)]
struct Track {
    id: i64,
    x: f64,
    y: f64,
    frame: usize,
    /// Displacement per frame between the last two observations.
    velocity: Option<(f64, f64)>,
}

impl Track {
    fn predict(&self, frame: usize, use_velocity: bool) -> (f64, f64) {
        match self.velocity {
            Some((vx, vy)) if use_velocity => {
                let dt = (frame - self.frame) as f64;
                (self.x + vx * dt, self.y + vy * dt)
            }
            _ => (self.x, self.y),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    track: usize,
    feature: usize,
    distance: f64,
}

pub struct NearestNeighborLinker {
    config: LinkConfig,
    max_subnet_size: usize,
    tracks: Vec<Track>,
    next_id: i64,
    last_frame: Option<usize>,
}

impl NearestNeighborLinker {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            max_subnet_size: DEFAULT_MAX_SUBNET_SIZE,
            tracks: Vec::new(),
            next_id: 0,
            last_frame: None,
        }
    }

    pub fn with_max_subnet_size(mut self, size: usize) -> Self {
        self.max_subnet_size = size.max(1);
        self
    }

    fn candidates(
        &self,
        predicted: &[(f64, f64)],
        features: &[Feature],
        tracks: &[usize],
        feats: &[usize],
        range: f64,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for &t in tracks {
            let (px, py) = predicted[t];
            for &f in feats {
                let distance = features[f].distance_to(px, py);
                if distance <= range {
                    out.push(Candidate {
                        track: t,
                        feature: f,
                        distance,
                    });
                }
            }
        }
        out
    }

    /// Shrink the search radius inside every oversized subnetwork.
    fn adapt(
        &self,
        predicted: &[(f64, f64)],
        features: &[Feature],
        candidates: Vec<Candidate>,
        stop: f64,
    ) -> Vec<Candidate> {
        let step = self.config.adaptive_step;
        let mut settled = Vec::new();
        let mut pending = vec![(self.config.search_range, candidates)];

        while let Some((range, pairs)) = pending.pop() {
            for (tracks, feats, subnet) in subnetworks(&pairs, self.tracks.len()) {
                if tracks.len().max(feats.len()) <= self.max_subnet_size {
                    settled.extend(subnet);
                    continue;
                }
                let shrunk = range * step;
                if shrunk < stop {
                    tracing::warn!(
                        size = tracks.len().max(feats.len()),
                        range,
                        "subnetwork still oversized at adaptive-stop, linking greedily"
                    );
                    settled.extend(subnet);
                    continue;
                }
                let narrowed = self.candidates(predicted, features, &tracks, &feats, shrunk);
                pending.push((shrunk, narrowed));
            }
        }
        settled
    }
}

/// Connected components of the bipartite candidate graph, as
/// `(tracks, features, pairs)`.
fn subnetworks(
    pairs: &[Candidate],
    n_tracks: usize,
) -> Vec<(Vec<usize>, Vec<usize>, Vec<Candidate>)> {
    // 并查集: 轨迹节点 [0, n_tracks), 特征节点 n_tracks + i
    let mut parent: HashMap<usize, usize> = HashMap::new();
    fn find(parent: &mut HashMap<usize, usize>, node: usize) -> usize {
        let p = *parent.entry(node).or_insert(node);
        if p == node {
            return node;
        }
        let root = find(parent, p);
        parent.insert(node, root);
        root
    }
    for c in pairs {
        let a = find(&mut parent, c.track);
        let b = find(&mut parent, n_tracks + c.feature);
        if a != b {
            parent.insert(a, b);
        }
    }

    let mut groups: Vec<(usize, (Vec<usize>, Vec<usize>, Vec<Candidate>))> = Vec::new();
    for c in pairs {
        let root = find(&mut parent, c.track);
        let slot = match groups.iter().position(|(r, _)| *r == root) {
            Some(i) => i,
            None => {
                groups.push((root, (Vec::new(), Vec::new(), Vec::new())));
                groups.len() - 1
            }
        };
        let (tracks, feats, subnet) = &mut groups[slot].1;
        if !tracks.contains(&c.track) {
            tracks.push(c.track);
        }
        if !feats.contains(&c.feature) {
            feats.push(c.feature);
        }
        subnet.push(*c);
    }
    groups.into_iter().map(|(_, g)| g).collect()
}

impl TrajectoryLinker for NearestNeighborLinker {
    fn update(&mut self, frame: usize, features: &mut [Feature]) -> Result<()> {
        if let Some(last) = self.last_frame {
            if frame <= last {
                return Err(Error::invalid_argument(format!(
                    "frame {} fed after frame {}",
                    frame, last
                )));
            }
        }
        self.last_frame = Some(frame);

        // memory 帧内未出现的轨迹仍可续接
        let max_gap = self.config.memory + 1;
        self.tracks.retain(|t| frame - t.frame <= max_gap);

        let predicted: Vec<(f64, f64)> = self
            .tracks
            .iter()
            .map(|t| t.predict(frame, self.config.predict))
            .collect();
        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        let all_features: Vec<usize> = (0..features.len()).collect();
        let mut pairs = self.candidates(
            &predicted,
            features,
            &all_tracks,
            &all_features,
            self.config.search_range,
        );
        if let Some(stop) = self.config.adaptive_stop {
            pairs = self.adapt(&predicted, features, pairs, stop);
        }

        // 贪心匹配: 距离优先, 平局时按轨迹、特征序号
        pairs.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.track.cmp(&b.track))
                .then(a.feature.cmp(&b.feature))
        });
        let mut track_used = vec![false; self.tracks.len()];
        let mut matched: Vec<Option<usize>> = vec![None; features.len()];
        for c in pairs {
            if track_used[c.track] || matched[c.feature].is_some() {
                continue;
            }
            track_used[c.track] = true;
            matched[c.feature] = Some(c.track);
        }

        for (i, feature) in features.iter_mut().enumerate() {
            match matched[i] {
                Some(t) => {
                    let track = &mut self.tracks[t];
                    let dt = (frame - track.frame) as f64;
                    track.velocity = Some(((feature.x - track.x) / dt, (feature.y - track.y) / dt));
                    track.x = feature.x;
                    track.y = feature.y;
                    track.frame = frame;
                    feature.particle = Some(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        x: feature.x,
                        y: feature.y,
                        frame,
                        velocity: None,
                    });
                    feature.particle = Some(id);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
        self.last_frame = None;
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tracking::link_features;

    fn linker(search_range: f64) -> NearestNeighborLinker {
        NearestNeighborLinker::new(LinkConfig::new(search_range))
    }

    fn particle_at(out: &[Feature], frame: usize, x: f64) -> i64 {
        out.iter()
            .find(|f| f.frame == frame && (f.x - x).abs() < 1e-9)
            .and_then(|f| f.particle)
            .unwrap()
    }

    #[test]
    fn test_links_drifting_particles() {
        let mut features = Vec::new();
        for frame in 0..5 {
            features.push(Feature::at(frame, 10.0 + frame as f64, 10.0));
            features.push(Feature::at(frame, 50.0 - frame as f64, 30.0));
        }
        let out = link_features(&mut linker(5.0), features).unwrap();
        assert_eq!(out.len(), 10);
        let a = particle_at(&out, 0, 10.0);
        let b = particle_at(&out, 0, 50.0);
        assert_ne!(a, b);
        for frame in 1..5 {
            assert_eq!(particle_at(&out, frame, 10.0 + frame as f64), a);
            assert_eq!(particle_at(&out, frame, 50.0 - frame as f64), b);
        }
        // (frame, particle) 排序
        assert!(out.windows(2).all(|w| (w[0].frame, w[0].particle) <= (w[1].frame, w[1].particle)));
    }

    #[test]
    fn test_out_of_range_starts_new_track() {
        let features = vec![Feature::at(0, 0.0, 0.0), Feature::at(1, 30.0, 0.0)];
        let out = link_features(&mut linker(5.0), features).unwrap();
        assert_eq!(out[0].particle, Some(0));
        assert_eq!(out[1].particle, Some(1));
    }

    #[test]
    fn test_memory_bridges_gaps() {
        let features = vec![Feature::at(0, 5.0, 5.0), Feature::at(3, 6.0, 5.0)];
        let out = link_features(&mut linker(5.0), features.clone()).unwrap();
        assert_ne!(out[0].particle, out[1].particle);

        let mut config = LinkConfig::new(5.0);
        config.memory = 2;
        let out = link_features(&mut NearestNeighborLinker::new(config), features).unwrap();
        assert_eq!(out[0].particle, out[1].particle);
    }

    #[test]
    fn test_prediction_follows_velocity() {
        // 两个粒子交会, 无预测时最近邻会串号
        let mut features = Vec::new();
        for frame in 0..4 {
            let step = 4.0 * frame as f64;
            features.push(Feature::at(frame, 10.0 + step, 10.0));
            features.push(Feature::at(frame, 24.0 - step, 10.0));
        }
        let mut config = LinkConfig::new(6.0);
        config.predict = true;
        let out = link_features(&mut NearestNeighborLinker::new(config), features).unwrap();
        let a = particle_at(&out, 0, 10.0);
        assert_eq!(particle_at(&out, 3, 22.0), a);
    }

    #[test]
    fn test_adaptive_search_shrinks_dense_subnets() {
        // 间距 3 的格点, 全部平移 1 像素
        let mut features = Vec::new();
        for frame in 0..2 {
            for i in 0..6 {
                features.push(Feature::at(frame, i as f64 * 3.0 + frame as f64, 0.0));
            }
        }
        let mut config = LinkConfig::new(10.0);
        config.adaptive_stop = Some(1.0);
        config.adaptive_step = 0.5;
        let mut l = NearestNeighborLinker::new(config).with_max_subnet_size(2);
        let out = link_features(&mut l, features).unwrap();
        for i in 0..6 {
            let x = i as f64 * 3.0;
            assert_eq!(particle_at(&out, 0, x), particle_at(&out, 1, x + 1.0));
        }
    }

    #[test]
    fn test_rejects_frames_out_of_order() {
        let mut l = linker(5.0);
        l.update(3, &mut [Feature::at(3, 0.0, 0.0)]).unwrap();
        let err = l.update(2, &mut [Feature::at(2, 0.0, 0.0)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        l.reset();
        assert_eq!(l.track_count(), 0);
        l.update(2, &mut [Feature::at(2, 0.0, 0.0)]).unwrap();
        assert_eq!(l.track_count(), 1);
    }
}
