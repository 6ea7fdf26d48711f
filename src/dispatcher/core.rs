//! The dispatcher's scheduling state machine.
//!
//! Pure state + classified inputs + effect lists, so every scheduling
//! rule can be exercised per tick without sockets. The runtime in
//! [`super::run`] only moves frames between pipes and this core.
//!
//! Invariants the core maintains per tick:
//! - a daemon never idles while the queue is non-empty;
//! - a task id is in at most one of {queued, assigned, completed};
//! - `busy -> idle` happens on reply forward, atomically with the next
//!   queue pop.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::protocol::{
    ControlFrame, ControlReply, Message, ReplyEnvelope, ReplyStatus, StatusReport, TaskEnvelope,
};
use crate::transport::PipeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    /// Holds the full envelope so a crashed daemon's task can be
    /// requeued under the retry policy.
    Busy(TaskEnvelope),
}

#[derive(Debug, Clone)]
pub struct DaemonEntry {
    pub pipe: PipeId,
    pub daemon_id: Option<u32>,
    pub state: DaemonState,
}

impl DaemonEntry {
    fn is_idle(&self) -> bool {
        matches!(self.state, DaemonState::Idle)
    }
}

/// One classified readiness event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Task envelope arrived from the host.
    Task(TaskEnvelope),
    /// Control command arrived from the host.
    Control(ControlFrame),
    /// Host asked every daemon to exit after its current task.
    ExitAll,
    /// A daemon completed its dial-in hello.
    Connected {
        pipe: PipeId,
        daemon_id: Option<u32>,
    },
    /// A reply envelope arrived from a daemon.
    Reply { pipe: PipeId, reply: ReplyEnvelope },
    /// A daemon's pipe dropped.
    Disconnected { pipe: PipeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ToDaemon { pipe: PipeId, msg: Message },
    ToHost(Message),
    ClosePipe(PipeId),
}

pub struct Core {
    queue: VecDeque<TaskEnvelope>,
    /// Connection order; the idle daemon with the smallest position
    /// wins ties.
    roster: Vec<DaemonEntry>,
    /// task id -> executing pipe, for cancel lookups.
    by_task: HashMap<u32, PipeId>,
    completed: u64,
    events: VecDeque<i64>,
    events_capacity: usize,
    retry: bool,
    /// Tasks force-cancelled while executing; their daemon's disconnect
    /// resolves them as cancelled instead of requeueing.
    force_cancelled: HashSet<u32>,
}

impl Core {
    pub fn new(retry: bool, events_capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            roster: Vec::new(),
            by_task: HashMap::new(),
            completed: 0,
            events: VecDeque::new(),
            events_capacity: events_capacity.max(1),
            retry,
            force_cancelled: HashSet::new(),
        }
    }

    pub fn connections(&self) -> usize {
        self.roster.len()
    }

    pub fn awaiting(&self) -> usize {
        self.queue.len()
    }

    pub fn executing(&self) -> usize {
        self.roster.iter().filter(|d| !d.is_idle()).count()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Task(task) => self.on_task(task),
            Input::Control(control) => self.on_control(control),
            Input::ExitAll => self.on_exit_all(),
            Input::Connected { pipe, daemon_id } => self.on_connected(pipe, daemon_id),
            Input::Reply { pipe, reply } => self.on_reply(pipe, reply),
            Input::Disconnected { pipe } => self.on_disconnected(pipe),
        }
    }

    fn on_task(&mut self, task: TaskEnvelope) -> Vec<Effect> {
        if let Some(entry) = self.roster.iter_mut().find(|d| d.is_idle()) {
            let pipe = entry.pipe;
            entry.state = DaemonState::Busy(task.clone());
            self.by_task.insert(task.task_id, pipe);
            vec![Effect::ToDaemon {
                pipe,
                msg: Message::Task(task),
            }]
        } else {
            self.queue.push_back(task);
            Vec::new()
        }
    }

    fn on_control(&mut self, control: ControlFrame) -> Vec<Effect> {
        if control.is_status() {
            let report = StatusReport {
                connections: self.roster.len() as u32,
                awaiting: self.queue.len() as u32,
                executing: self.executing() as u32,
                events: self.events.drain(..).collect(),
            };
            return vec![Effect::ToHost(Message::ControlReply(ControlReply::Status(
                report,
            )))];
        }

        let task_id = control.cmd;
        if let Some(pos) = self.queue.iter().position(|t| t.task_id == task_id) {
            self.queue.remove(pos);
            return vec![
                Effect::ToHost(Message::ControlReply(ControlReply::Cancelled(true))),
                Effect::ToHost(Message::Reply(cancelled_reply(task_id))),
            ];
        }

        let mut effects = vec![Effect::ToHost(Message::ControlReply(
            ControlReply::Cancelled(false),
        ))];
        if control.is_force()
            && let Some(&pipe) = self.by_task.get(&task_id)
        {
            // Respawn request: drop the executing daemon's pipe. The
            // disconnect resolves the task as cancelled, not requeued.
            self.force_cancelled.insert(task_id);
            effects.push(Effect::ClosePipe(pipe));
        }
        effects
    }

    fn on_exit_all(&mut self) -> Vec<Effect> {
        // Busy daemons buffer the sentinel and act on it after their
        // current task.
        self.roster
            .iter()
            .map(|entry| Effect::ToDaemon {
                pipe: entry.pipe,
                msg: Message::Exit,
            })
            .collect()
    }

    fn on_connected(&mut self, pipe: PipeId, daemon_id: Option<u32>) -> Vec<Effect> {
        self.roster.push(DaemonEntry {
            pipe,
            daemon_id,
            state: DaemonState::Idle,
        });
        if let Some(id) = daemon_id {
            self.push_event(i64::from(id));
        }

        match self.queue.pop_front() {
            Some(task) => {
                let entry = self.roster.last_mut().expect("just pushed");
                entry.state = DaemonState::Busy(task.clone());
                self.by_task.insert(task.task_id, pipe);
                vec![Effect::ToDaemon {
                    pipe,
                    msg: Message::Task(task),
                }]
            }
            None => Vec::new(),
        }
    }

    fn on_reply(&mut self, pipe: PipeId, reply: ReplyEnvelope) -> Vec<Effect> {
        let Some(entry) = self.roster.iter_mut().find(|d| d.pipe == pipe) else {
            return Vec::new();
        };
        let DaemonState::Busy(task) = &entry.state else {
            // Stray reply from an idle daemon: nothing to route it to.
            return Vec::new();
        };
        let task_id = task.task_id;
        debug_assert_eq!(task_id, reply.task_id, "reply out of request order");

        // busy -> idle and the queue pop are one tick: the daemon never
        // idles while work is waiting.
        entry.state = DaemonState::Idle;
        self.by_task.remove(&task_id);
        self.force_cancelled.remove(&task_id);
        self.completed += 1;

        let mut effects = vec![Effect::ToHost(Message::Reply(reply))];
        if let Some(next) = self.queue.pop_front() {
            let entry = self
                .roster
                .iter_mut()
                .find(|d| d.pipe == pipe)
                .expect("entry still present");
            entry.state = DaemonState::Busy(next.clone());
            self.by_task.insert(next.task_id, pipe);
            effects.push(Effect::ToDaemon {
                pipe,
                msg: Message::Task(next),
            });
        }
        effects
    }

    fn on_disconnected(&mut self, pipe: PipeId) -> Vec<Effect> {
        let Some(pos) = self.roster.iter().position(|d| d.pipe == pipe) else {
            return Vec::new();
        };
        let entry = self.roster.remove(pos);
        if let Some(id) = entry.daemon_id {
            self.push_event(-i64::from(id));
        }

        let DaemonState::Busy(task) = entry.state else {
            return Vec::new();
        };
        self.by_task.remove(&task.task_id);

        if self.force_cancelled.remove(&task.task_id) {
            self.completed += 1;
            return vec![Effect::ToHost(Message::Reply(cancelled_reply(
                task.task_id,
            )))];
        }

        if self.retry {
            // Head of the queue: the task keeps its original position
            // relative to work submitted after it.
            self.queue.push_front(task);
            return Vec::new();
        }

        self.completed += 1;
        vec![Effect::ToHost(Message::Reply(ReplyEnvelope {
            task_id: task.task_id,
            status: ReplyStatus::ConnectionReset,
            payload: Vec::new(),
        }))]
    }

    fn push_event(&mut self, event: i64) {
        if self.events.len() == self.events_capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        if !self.queue.is_empty() {
            assert!(
                self.roster.iter().all(|d| !d.is_idle()),
                "queue non-empty while a daemon idles"
            );
        }
        for entry in &self.roster {
            if let DaemonState::Busy(task) = &entry.state {
                assert_eq!(self.by_task.get(&task.task_id), Some(&entry.pipe));
                assert!(
                    !self.queue.iter().any(|t| t.task_id == task.task_id),
                    "task both queued and assigned"
                );
            }
        }
    }
}

fn cancelled_reply(task_id: u32) -> ReplyEnvelope {
    ReplyEnvelope {
        task_id,
        status: ReplyStatus::Cancelled,
        payload: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u32) -> TaskEnvelope {
        TaskEnvelope {
            task_id: id,
            payload: format!("task-{id}").into_bytes(),
        }
    }

    fn reply(id: u32) -> ReplyEnvelope {
        ReplyEnvelope {
            task_id: id,
            status: ReplyStatus::Ok,
            payload: b"done".to_vec(),
        }
    }

    fn connect(core: &mut Core, pipe: PipeId, daemon_id: u32) -> Vec<Effect> {
        let effects = core.handle(Input::Connected {
            pipe,
            daemon_id: Some(daemon_id),
        });
        core.assert_invariants();
        effects
    }

    fn drive(core: &mut Core, input: Input) -> Vec<Effect> {
        let effects = core.handle(input);
        core.assert_invariants();
        effects
    }

    fn status(core: &mut Core) -> StatusReport {
        let effects = drive(core, Input::Control(ControlFrame::STATUS));
        match effects.as_slice() {
            [Effect::ToHost(Message::ControlReply(ControlReply::Status(report)))] => report.clone(),
            other => panic!("expected status reply, got {other:?}"),
        }
    }

    #[test]
    fn tasks_go_to_earliest_idle_daemon() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        connect(&mut core, 11, 2);

        let effects = drive(&mut core, Input::Task(task(1)));
        assert_eq!(
            effects,
            vec![Effect::ToDaemon {
                pipe: 10,
                msg: Message::Task(task(1))
            }]
        );

        let effects = drive(&mut core, Input::Task(task(2)));
        assert_eq!(
            effects,
            vec![Effect::ToDaemon {
                pipe: 11,
                msg: Message::Task(task(2))
            }]
        );

        // Both busy: third task queues.
        assert!(drive(&mut core, Input::Task(task(3))).is_empty());
        assert_eq!(core.awaiting(), 1);
        assert_eq!(core.executing(), 2);
    }

    #[test]
    fn reply_forwards_then_pops_queue_in_the_same_tick() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));
        drive(&mut core, Input::Task(task(2)));
        assert_eq!(core.awaiting(), 1);

        let effects = drive(
            &mut core,
            Input::Reply {
                pipe: 10,
                reply: reply(1),
            },
        );
        assert_eq!(
            effects,
            vec![
                Effect::ToHost(Message::Reply(reply(1))),
                Effect::ToDaemon {
                    pipe: 10,
                    msg: Message::Task(task(2))
                },
            ]
        );
        assert_eq!(core.awaiting(), 0);
        assert_eq!(core.executing(), 1);
        assert_eq!(core.completed(), 1);
    }

    #[test]
    fn connecting_daemon_drains_queue_head() {
        let mut core = Core::new(false, 16);
        drive(&mut core, Input::Task(task(1)));
        drive(&mut core, Input::Task(task(2)));

        let effects = connect(&mut core, 10, 1);
        assert_eq!(
            effects,
            vec![Effect::ToDaemon {
                pipe: 10,
                msg: Message::Task(task(1))
            }]
        );
        assert_eq!(core.awaiting(), 1);
    }

    #[test]
    fn accounting_adds_up_at_every_observation_point() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        connect(&mut core, 11, 2);

        let mut submitted = 0u64;
        for id in 1..=5 {
            drive(&mut core, Input::Task(task(id)));
            submitted += 1;
            let report = status(&mut core);
            assert_eq!(
                submitted,
                core.completed() + u64::from(report.awaiting) + u64::from(report.executing)
            );
        }

        for (pipe, id) in [(10u64, 1u32), (11, 2), (10, 3), (11, 4), (10, 5)] {
            drive(
                &mut core,
                Input::Reply {
                    pipe,
                    reply: reply(id),
                },
            );
            let report = status(&mut core);
            assert_eq!(
                submitted,
                core.completed() + u64::from(report.awaiting) + u64::from(report.executing)
            );
        }
        assert_eq!(core.completed(), 5);
    }

    #[test]
    fn status_drains_signed_connect_events() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 7);
        connect(&mut core, 11, 8);
        drive(&mut core, Input::Disconnected { pipe: 10 });

        let report = status(&mut core);
        assert_eq!(report.events, vec![7, 8, -7]);
        assert_eq!(report.connections, 1);

        // Drained: the next query reports only newer events.
        let report = status(&mut core);
        assert!(report.events.is_empty());
    }

    #[test]
    fn events_ring_drops_oldest_when_full() {
        let mut core = Core::new(false, 2);
        connect(&mut core, 10, 1);
        connect(&mut core, 11, 2);
        connect(&mut core, 12, 3);
        assert_eq!(status(&mut core).events, vec![2, 3]);
    }

    #[test]
    fn cancel_before_dispatch_removes_from_queue() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));
        drive(&mut core, Input::Task(task(2)));

        let effects = drive(&mut core, Input::Control(ControlFrame::cancel(2, false)));
        assert_eq!(
            effects,
            vec![
                Effect::ToHost(Message::ControlReply(ControlReply::Cancelled(true))),
                Effect::ToHost(Message::Reply(cancelled_reply(2))),
            ]
        );
        assert_eq!(core.awaiting(), 0);

        // Task 1 still completes normally.
        let effects = drive(
            &mut core,
            Input::Reply {
                pipe: 10,
                reply: reply(1),
            },
        );
        assert_eq!(effects, vec![Effect::ToHost(Message::Reply(reply(1)))]);
    }

    #[test]
    fn cancel_of_executing_task_is_a_miss_unless_forced() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));

        let effects = drive(&mut core, Input::Control(ControlFrame::cancel(1, false)));
        assert_eq!(
            effects,
            vec![Effect::ToHost(Message::ControlReply(
                ControlReply::Cancelled(false)
            ))]
        );

        // Idempotent on unknown ids.
        let effects = drive(&mut core, Input::Control(ControlFrame::cancel(99, false)));
        assert_eq!(
            effects,
            vec![Effect::ToHost(Message::ControlReply(
                ControlReply::Cancelled(false)
            ))]
        );
    }

    #[test]
    fn force_cancel_closes_pipe_and_resolves_cancelled_even_with_retry() {
        let mut core = Core::new(true, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));

        let effects = drive(&mut core, Input::Control(ControlFrame::cancel(1, true)));
        assert_eq!(
            effects,
            vec![
                Effect::ToHost(Message::ControlReply(ControlReply::Cancelled(false))),
                Effect::ClosePipe(10),
            ]
        );

        // The close lands as a disconnect; retry must not requeue a
        // force-cancelled task.
        let effects = drive(&mut core, Input::Disconnected { pipe: 10 });
        assert_eq!(
            effects,
            vec![Effect::ToHost(Message::Reply(cancelled_reply(1)))]
        );
        assert_eq!(core.awaiting(), 0);
    }

    #[test]
    fn disconnect_without_retry_synthesizes_connection_reset() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));

        let effects = drive(&mut core, Input::Disconnected { pipe: 10 });
        assert_eq!(
            effects,
            vec![Effect::ToHost(Message::Reply(ReplyEnvelope {
                task_id: 1,
                status: ReplyStatus::ConnectionReset,
                payload: Vec::new(),
            }))]
        );
    }

    #[test]
    fn disconnect_with_retry_requeues_at_head_for_next_daemon() {
        let mut core = Core::new(true, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));
        drive(&mut core, Input::Task(task(2)));

        assert!(drive(&mut core, Input::Disconnected { pipe: 10 }).is_empty());
        // Task 1 sits ahead of task 2 again.
        assert_eq!(core.awaiting(), 2);

        let effects = connect(&mut core, 11, 2);
        assert_eq!(
            effects,
            vec![Effect::ToDaemon {
                pipe: 11,
                msg: Message::Task(task(1))
            }]
        );
    }

    #[test]
    fn exit_all_reaches_idle_and_busy_daemons() {
        let mut core = Core::new(false, 16);
        connect(&mut core, 10, 1);
        connect(&mut core, 11, 2);
        drive(&mut core, Input::Task(task(1)));

        let effects = drive(&mut core, Input::ExitAll);
        assert_eq!(
            effects,
            vec![
                Effect::ToDaemon {
                    pipe: 10,
                    msg: Message::Exit
                },
                Effect::ToDaemon {
                    pipe: 11,
                    msg: Message::Exit
                },
            ]
        );
    }

    #[test]
    fn task_ids_never_resolve_twice() {
        // Force-cancel racing a real reply: the reply wins, and the
        // disconnect afterwards must not synthesize a second reply.
        let mut core = Core::new(true, 16);
        connect(&mut core, 10, 1);
        drive(&mut core, Input::Task(task(1)));
        drive(&mut core, Input::Control(ControlFrame::cancel(1, true)));

        let effects = drive(
            &mut core,
            Input::Reply {
                pipe: 10,
                reply: reply(1),
            },
        );
        assert_eq!(effects, vec![Effect::ToHost(Message::Reply(reply(1)))]);

        let effects = drive(&mut core, Input::Disconnected { pipe: 10 });
        assert!(effects.is_empty(), "no second resolution for task 1");
    }
}
