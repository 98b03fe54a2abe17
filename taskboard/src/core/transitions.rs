//! Legal status graph for cards.
//!
//! ```text
//! Backlog -> Todo -> Active -> {Integrate, Review, Blocked, Failed}
//! Integrate -> {Review, Active, Blocked, Failed}
//! Review -> {Done, Active, Failed}
//! Blocked -> {Todo, Active, Failed}
//! Failed -> {Todo, Active}
//! Done (terminal)
//! ```

use crate::card::CardStatus;

/// Targets reachable in one step from `from`.
pub fn allowed_targets(from: CardStatus) -> &'static [CardStatus] {
    use CardStatus as S;
    match from {
        S::Backlog => &[S::Todo],
        S::Todo => &[S::Active],
        S::Active => &[S::Integrate, S::Review, S::Blocked, S::Failed],
        S::Integrate => &[S::Review, S::Active, S::Blocked, S::Failed],
        S::Review => &[S::Done, S::Active, S::Failed],
        S::Blocked => &[S::Todo, S::Active, S::Failed],
        S::Failed => &[S::Todo, S::Active],
        S::Done => &[],
    }
}

pub fn can_transition(from: CardStatus, to: CardStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Shortest legal walk from `from` to `to`, excluding `from` itself.
///
/// Used by composite operations (start, complete, handoff) that must record
/// every intermediate edge. Returns `None` when `to` is unreachable.
pub fn path_to(from: CardStatus, to: CardStatus) -> Option<Vec<CardStatus>> {
    if from == to {
        return Some(Vec::new());
    }
    let mut previous: [Option<CardStatus>; 8] = [None; 8];
    let mut visited = [false; 8];
    let mut queue = std::collections::VecDeque::new();
    visited[index(from)] = true;
    queue.push_back(from);

    while let Some(current) = queue.pop_front() {
        for &next in allowed_targets(current) {
            if visited[index(next)] {
                continue;
            }
            visited[index(next)] = true;
            previous[index(next)] = Some(current);
            if next == to {
                let mut path = vec![to];
                let mut cursor = current;
                while cursor != from {
                    path.push(cursor);
                    cursor = previous[index(cursor)]?;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

fn index(status: CardStatus) -> usize {
    CardStatus::ALL
        .iter()
        .position(|candidate| *candidate == status)
        .unwrap_or(0)
}
