//! 多目标跟踪 - 中心点最近邻匹配
//! Centroid-distance multi-object tracking

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::types::DetectionBox;

// ========== 公共数据结构 ==========

/// 跟踪对象
#[derive(Clone, Debug)]
pub struct TrackedEntity {
    /// 唯一跟踪ID (从1开始单调递增, 不复用)
    pub id: u32,

    /// 最近一次匹配到的检测框
    pub last_box: DetectionBox,

    /// 连续丢失帧数
    pub frames_lost: u32,
}

impl TrackedEntity {
    /// 获取中心点
    pub fn center(&self) -> (f32, f32) {
        self.last_box.center()
    }
}

// ========== 跟踪器统一接口 ==========

/// 多目标跟踪器 Trait
pub trait Tracker: Send {
    /// 更新跟踪器, 就地写入每个检测框的 `track_id`
    fn update(&mut self, detections: &mut [DetectionBox]);

    /// 重置跟踪器 (清除所有跟踪, ID 计数保持)
    fn reset(&mut self);

    /// 获取当前跟踪数量
    fn track_count(&self) -> usize;
}

// ========== 中心点跟踪器 ==========

/// 中心点跟踪器
///
/// 贪心最近邻: 每个检测框按输入顺序与所有现存目标比较中心点距离,
/// 距离小于阈值即沿用该目标ID. 同一帧内两个检测框可能匹配到同一目标.
pub struct CentroidTracker {
    entities: BTreeMap<u32, TrackedEntity>,
    next_id: u32,
    distance_threshold: f32,
    max_frames_lost: u32,
}

impl CentroidTracker {
    pub fn new(distance_threshold: f32, max_frames_lost: u32) -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
            distance_threshold,
            max_frames_lost,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    /// 最近目标 (id, 距离)
    fn nearest(&self, center: (f32, f32)) -> Option<(u32, f32)> {
        self.entities
            .values()
            .map(|entity| (entity.id, distance(center, entity.center())))
            .fold(None, |best, (id, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((id, d)),
            })
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new(50.0, 10)
    }
}

impl Tracker for CentroidTracker {
    fn update(&mut self, detections: &mut [DetectionBox]) {
        let mut matched = BTreeSet::new();

        for det in detections.iter_mut() {
            let center = det.center();
            let id = match self.nearest(center) {
                Some((id, d)) if d < self.distance_threshold => id,
                _ => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!("🆕 新目标 #{} @ ({:.0}, {:.0})", id, center.0, center.1);
                    id
                }
            };

            det.track_id = id;
            self.entities.insert(
                id,
                TrackedEntity {
                    id,
                    last_box: det.clone(),
                    frames_lost: 0,
                },
            );
            matched.insert(id);
        }

        for entity in self.entities.values_mut() {
            if !matched.contains(&entity.id) {
                entity.frames_lost += 1;
            }
        }

        let max_lost = self.max_frames_lost;
        self.entities.retain(|id, entity| {
            let keep = entity.frames_lost <= max_lost;
            if !keep {
                debug!("🗑️ 目标 #{} 丢失 {} 帧, 移除", id, entity.frames_lost);
            }
            keep
        });
    }

    fn reset(&mut self) {
        self.entities.clear();
    }

    fn track_count(&self) -> usize {
        self.entities.len()
    }
}

// ========== 工具函数 ==========

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
