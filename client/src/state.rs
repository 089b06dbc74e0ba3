//! Client process state machine
//!
//! [`reduce`] is pure. Any (state, action) pair without a transition returns
//! the input `Arc` itself, so callers detect "nothing changed" with
//! [`Arc::ptr_eq`].

use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{OutputLine, ProcessStatus};

/// Lines a client keeps per process unless told otherwise
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Bounded, oldest-first view of a process's output.
///
/// Lines are shared between states, so deriving the next state copies at
/// most `max_lines` pointers however long the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLog {
    lines: VecDeque<Arc<OutputLine>>,
    max_lines: usize,
}

type LogIter<'a> =
    std::iter::Map<std::collections::vec_deque::Iter<'a, Arc<OutputLine>>, fn(&Arc<OutputLine>) -> &OutputLine>;

impl OutputLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn iter(&self) -> LogIter<'_> {
        self.lines.iter().map(shared_line as fn(&Arc<OutputLine>) -> &OutputLine)
    }

    /// Seq of the newest line held
    pub fn last_seq(&self) -> Option<u64> {
        self.lines.back().map(|line| line.seq)
    }

    /// A copy with `line` appended, evicting the oldest line at the limit
    fn with_line(&self, line: OutputLine) -> Self {
        let mut next = self.clone();
        if next.lines.len() >= next.max_lines {
            next.lines.pop_front();
        }
        next.lines.push_back(Arc::new(line));
        next
    }
}

fn shared_line(line: &Arc<OutputLine>) -> &OutputLine {
    line
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl<'a> IntoIterator for &'a OutputLog {
    type Item = &'a OutputLine;
    type IntoIter = LogIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<OutputLine> for OutputLog {
    fn from_iter<I: IntoIterator<Item = OutputLine>>(iter: I) -> Self {
        iter.into_iter()
            .fold(OutputLog::default(), |log, line| log.with_line(line))
    }
}

/// What the client believes about its process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Starting {
        command: String,
    },
    Running {
        id: String,
        pid: u32,
        lines: OutputLog,
    },
    Completed {
        id: String,
        code: Option<i32>,
        lines: OutputLog,
    },
}

impl ProcessState {
    /// Id of the tracked process, once known
    pub fn process_id(&self) -> Option<&str> {
        match self {
            ProcessState::Running { id, .. } | ProcessState::Completed { id, .. } => Some(id),
            ProcessState::Idle | ProcessState::Starting { .. } => None,
        }
    }

    /// Output held for the tracked process; empty before it is known
    pub fn lines(&self) -> OutputLogRef<'_> {
        match self {
            ProcessState::Running { lines, .. } | ProcessState::Completed { lines, .. } => {
                OutputLogRef(Some(lines))
            }
            ProcessState::Idle | ProcessState::Starting { .. } => OutputLogRef(None),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// Borrowed view of a state's output, empty for states without a process
#[derive(Debug, Clone, Copy)]
pub struct OutputLogRef<'a>(Option<&'a OutputLog>);

impl<'a> OutputLogRef<'a> {
    pub fn len(&self) -> usize {
        self.0.map_or(0, OutputLog::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a OutputLine> {
        self.0.into_iter().flat_map(OutputLog::iter)
    }
}

impl<'a> IntoIterator for OutputLogRef<'a> {
    type Item = &'a OutputLine;
    type IntoIter = std::iter::Flatten<std::option::IntoIter<LogIter<'a>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.map(OutputLog::iter).into_iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessAction {
    Start { command: String },
    Started { id: String, pid: u32 },
    /// Adopt a process discovered through the running list
    Attach { id: String, pid: u32 },
    Output { id: String, line: OutputLine },
    Exit { id: String, code: Option<i32> },
    Error { message: String },
    Reconcile { id: String, status: ProcessStatus },
    Reset,
}

/// [`reduce_with_limit`] keeping [`DEFAULT_MAX_LINES`]
pub fn reduce(state: &Arc<ProcessState>, action: ProcessAction) -> Arc<ProcessState> {
    reduce_with_limit(state, action, DEFAULT_MAX_LINES)
}

/// Apply `action`. A newly tracked process keeps at most `max_lines` lines.
pub fn reduce_with_limit(
    state: &Arc<ProcessState>,
    action: ProcessAction,
    max_lines: usize,
) -> Arc<ProcessState> {
    use ProcessAction as A;
    use ProcessState as S;

    match (state.as_ref(), action) {
        (S::Idle | S::Completed { .. }, A::Start { command }) => {
            Arc::new(S::Starting { command })
        }
        (S::Idle, A::Attach { id, pid }) | (S::Starting { .. }, A::Started { id, pid }) => {
            Arc::new(S::Running {
                id,
                pid,
                lines: OutputLog::new(max_lines),
            })
        }
        (S::Starting { .. }, A::Error { .. }) => Arc::new(S::Idle),
        (S::Running { id, pid, lines }, A::Output { id: target, line }) if *id == target => {
            // Replays after a reconnect resend lines we already hold
            if lines.last_seq().is_some_and(|last| line.seq <= last) {
                return Arc::clone(state);
            }
            Arc::new(S::Running {
                id: id.clone(),
                pid: *pid,
                lines: lines.with_line(line),
            })
        }
        (S::Running { id, lines, .. }, A::Exit { id: target, code }) if *id == target => {
            Arc::new(S::Completed {
                id: id.clone(),
                code,
                lines: lines.clone(),
            })
        }
        (S::Running { id, lines, .. }, A::Reconcile { id: target, status }) if *id == target => {
            let code = match status {
                ProcessStatus::Running { .. } => return Arc::clone(state),
                ProcessStatus::Exited { code } => code,
                ProcessStatus::NotFound => None,
            };
            Arc::new(S::Completed {
                id: id.clone(),
                code,
                lines: lines.clone(),
            })
        }
        (S::Completed { .. }, A::Reset) => Arc::new(S::Idle),
        _ => Arc::clone(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputStream;

    fn line(seq: u64, text: &str) -> OutputLine {
        OutputLine {
            seq,
            stream: OutputStream::Stdout,
            line: text.to_string(),
            timestamp: 0,
        }
    }

    fn running(id: &str) -> Arc<ProcessState> {
        Arc::new(ProcessState::Running {
            id: id.to_string(),
            pid: 10,
            lines: OutputLog::default(),
        })
    }

    fn completed() -> Arc<ProcessState> {
        Arc::new(ProcessState::Completed {
            id: "p1".to_string(),
            code: Some(0),
            lines: OutputLog::default(),
        })
    }

    fn all_actions() -> Vec<ProcessAction> {
        vec![
            ProcessAction::Start {
                command: "ls".to_string(),
            },
            ProcessAction::Started {
                id: "p1".to_string(),
                pid: 1,
            },
            ProcessAction::Attach {
                id: "p1".to_string(),
                pid: 1,
            },
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(1, "x"),
            },
            ProcessAction::Exit {
                id: "p1".to_string(),
                code: Some(0),
            },
            ProcessAction::Error {
                message: "boom".to_string(),
            },
            ProcessAction::Reconcile {
                id: "p1".to_string(),
                status: ProcessStatus::NotFound,
            },
            ProcessAction::Reset,
        ]
    }

    #[test]
    fn test_happy_path() {
        let s = Arc::new(ProcessState::Idle);
        let s = reduce(
            &s,
            ProcessAction::Start {
                command: "echo hi".to_string(),
            },
        );
        assert_eq!(
            *s,
            ProcessState::Starting {
                command: "echo hi".to_string()
            }
        );

        let s = reduce(
            &s,
            ProcessAction::Started {
                id: "p1".to_string(),
                pid: 42,
            },
        );
        let s = reduce(
            &s,
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(1, "hi"),
            },
        );
        assert_eq!(s.lines().len(), 1);

        let s = reduce(
            &s,
            ProcessAction::Exit {
                id: "p1".to_string(),
                code: Some(0),
            },
        );
        assert_eq!(
            *s,
            ProcessState::Completed {
                id: "p1".to_string(),
                code: Some(0),
                lines: [line(1, "hi")].into_iter().collect(),
            }
        );

        let s = reduce(&s, ProcessAction::Reset);
        assert_eq!(*s, ProcessState::Idle);
    }

    #[test]
    fn test_start_error_returns_to_idle() {
        let s = Arc::new(ProcessState::Starting {
            command: "nope".to_string(),
        });
        let s = reduce(
            &s,
            ProcessAction::Error {
                message: "spawn failed".to_string(),
            },
        );
        assert_eq!(*s, ProcessState::Idle);
    }

    #[test]
    fn test_attach_adopts_running_process() {
        let s = Arc::new(ProcessState::Idle);
        let s = reduce(
            &s,
            ProcessAction::Attach {
                id: "p9".to_string(),
                pid: 99,
            },
        );
        assert!(s.is_running());
        assert_eq!(s.process_id(), Some("p9"));
    }

    #[test]
    fn test_completed_can_start_again() {
        let s = reduce(
            &completed(),
            ProcessAction::Start {
                command: "again".to_string(),
            },
        );
        assert!(matches!(*s, ProcessState::Starting { .. }));
    }

    #[test]
    fn test_events_for_other_process_are_ignored() {
        let s = running("p1");
        for action in [
            ProcessAction::Output {
                id: "p2".to_string(),
                line: line(1, "x"),
            },
            ProcessAction::Exit {
                id: "p2".to_string(),
                code: Some(1),
            },
            ProcessAction::Reconcile {
                id: "p2".to_string(),
                status: ProcessStatus::NotFound,
            },
        ] {
            assert!(Arc::ptr_eq(&s, &reduce(&s, action)));
        }
    }

    #[test]
    fn test_duplicate_replay_is_absorbed() {
        let s = running("p1");
        let s = reduce(
            &s,
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(1, "a"),
            },
        );
        let s = reduce(
            &s,
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(2, "b"),
            },
        );
        for seq in [1, 2] {
            let replay = ProcessAction::Output {
                id: "p1".to_string(),
                line: line(seq, "dup"),
            };
            assert!(Arc::ptr_eq(&s, &reduce(&s, replay)));
        }
        assert_eq!(s.lines().len(), 2);
    }

    #[test]
    fn test_output_is_capped_at_the_limit() {
        let mut s = reduce_with_limit(
            &Arc::new(ProcessState::Idle),
            ProcessAction::Attach {
                id: "p1".to_string(),
                pid: 1,
            },
            3,
        );
        for seq in 1..=10 {
            s = reduce_with_limit(
                &s,
                ProcessAction::Output {
                    id: "p1".to_string(),
                    line: line(seq, &format!("l{}", seq)),
                },
                3,
            );
        }

        let kept: Vec<_> = s.lines().iter().map(|l| l.seq).collect();
        assert_eq!(kept, vec![8, 9, 10]);

        // Eviction keeps the replay guard on the newest seq
        let replay = ProcessAction::Output {
            id: "p1".to_string(),
            line: line(9, "dup"),
        };
        assert!(Arc::ptr_eq(&s, &reduce_with_limit(&s, replay, 3)));
    }

    #[test]
    fn test_derived_states_share_lines() {
        let s = running("p1");
        let one = reduce(
            &s,
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(1, "a"),
            },
        );
        let two = reduce(
            &one,
            ProcessAction::Output {
                id: "p1".to_string(),
                line: line(2, "b"),
            },
        );
        let first = |state: &ProcessState| match state {
            ProcessState::Running { lines, .. } => lines.lines[0].clone(),
            _ => unreachable!(),
        };
        assert!(Arc::ptr_eq(&first(&one), &first(&two)));
    }

    #[test]
    fn test_reconcile() {
        let s = running("p1");

        let still_running = ProcessAction::Reconcile {
            id: "p1".to_string(),
            status: ProcessStatus::Running { pid: 10 },
        };
        assert!(Arc::ptr_eq(&s, &reduce(&s, still_running)));

        let exited = reduce(
            &s,
            ProcessAction::Reconcile {
                id: "p1".to_string(),
                status: ProcessStatus::Exited { code: Some(3) },
            },
        );
        assert!(matches!(*exited, ProcessState::Completed { code: Some(3), .. }));

        let gone = reduce(
            &s,
            ProcessAction::Reconcile {
                id: "p1".to_string(),
                status: ProcessStatus::NotFound,
            },
        );
        assert!(matches!(*gone, ProcessState::Completed { code: None, .. }));
    }

    #[test]
    fn test_pairs_outside_the_table_are_identity() {
        let states = [
            Arc::new(ProcessState::Idle),
            Arc::new(ProcessState::Starting {
                command: "ls".to_string(),
            }),
            running("p1"),
            completed(),
        ];

        let has_transition = |state: &ProcessState, action: &ProcessAction| {
            use ProcessAction as A;
            use ProcessState as S;
            matches!(
                (state, action),
                (S::Idle, A::Start { .. })
                    | (S::Idle, A::Attach { .. })
                    | (S::Starting { .. }, A::Started { .. })
                    | (S::Starting { .. }, A::Error { .. })
                    | (S::Running { .. }, A::Output { .. })
                    | (S::Running { .. }, A::Exit { .. })
                    | (S::Running { .. }, A::Reconcile { .. })
                    | (S::Completed { .. }, A::Reset)
                    | (S::Completed { .. }, A::Start { .. })
            )
        };

        for state in &states {
            for action in all_actions() {
                let next = reduce(state, action.clone());
                assert_eq!(
                    Arc::ptr_eq(state, &next),
                    !has_transition(state, &action),
                    "state {:?}, action {:?}",
                    state,
                    action
                );
            }
        }
    }
}
