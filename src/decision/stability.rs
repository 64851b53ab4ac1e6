//! 候选排序：置信度优先，置信度相同时偏向目标元素连续出现最久的候选

use std::cmp::Ordering;

use crate::decision::Candidate;
use crate::perception::{ElementId, WorldView};
use crate::session::Step;

/// 目标在当前 WorldView 及此前连续多少份 WorldView 中出现；无目标为 -1，当前不存在为 0
pub fn stability_streak(target: Option<&ElementId>, current: &WorldView, history: &[Step]) -> i64 {
    let Some(id) = target else {
        return -1;
    };
    if !current.contains(id) {
        return 0;
    }
    let mut streak = 1;
    for wv in history.iter().rev().filter_map(|s| s.world_view.as_ref()) {
        if !wv.contains(id) {
            break;
        }
        streak += 1;
    }
    streak
}

/// 稳定排序：置信度降序，其次稳定度降序，其余保持提案顺序
pub fn rank_candidates(mut candidates: Vec<Candidate>, current: &WorldView, history: &[Step]) -> Vec<Candidate> {
    let streaks: Vec<i64> = candidates
        .iter()
        .map(|c| stability_streak(c.action.target.as_ref(), current, history))
        .collect();
    let mut indexed: Vec<(usize, Candidate)> = candidates.drain(..).enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        b.confidence()
            .partial_cmp(&a.confidence())
            .unwrap_or(Ordering::Equal)
            .then(streaks[*ib].cmp(&streaks[*ia]))
    });
    indexed.into_iter().map(|(_, c)| c).collect()
}
