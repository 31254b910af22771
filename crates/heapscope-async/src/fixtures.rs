//! Heap shapes the .NET runtime produces, assembled on a `SnapshotBuilder`.

use heapscope_snapshot::{MemorySnapshot, SnapshotBuilder};

use crate::node::TASK_STATE_WAITING_FOR_ACTIVATION;

pub const TASK: &str = "System.Threading.Tasks.Task";
pub const RUNNER: &str = "System.Runtime.CompilerServices.AsyncMethodBuilderCore+MoveNextRunner";
pub const JOINABLE: &str = "Microsoft.VisualStudio.Threading.JoinableTask";
const ACTION: &str = "System.Action";
const BUILDER: &str = "System.Runtime.CompilerServices.AsyncTaskMethodBuilder";
const INNER_BUILDER: &str =
    "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1[[System.Threading.Tasks.VoidTaskResult]]";
const AWAIT_CONTINUATION: &str = "System.Threading.Tasks.AwaitTaskContinuation";
const STANDARD_CONTINUATION: &str = "System.Threading.Tasks.StandardTaskContinuation";
const CONTINUATION_TASK: &str = "System.Threading.Tasks.ContinuationTaskFromTask";
const WRAPPER: &str = "System.Runtime.CompilerServices.AsyncMethodBuilderCore+ContinuationWrapper";
const LIST: &str = "System.Collections.Generic.List<System.Object>";
const OBJECT_ARRAY: &str = "System.Object[]";
pub const TASK_AWAITER: &str = "System.Runtime.CompilerServices.TaskAwaiter";

pub struct Boxed {
    pub task: u64,
    pub state_machine: u64,
    pub move_next: Option<u64>,
}

pub struct Machine {
    pub task: u64,
    pub state_machine: u64,
    pub runner: u64,
}

pub struct Heap {
    pub b: SnapshotBuilder,
}

impl Heap {
    pub fn new() -> Self {
        let mut b = SnapshotBuilder::new();
        b.declare_type(TASK, Some("System.Object"));
        b.declare_type(JOINABLE, Some("System.Object"));
        Self { b }
    }

    pub fn build(self) -> MemorySnapshot {
        self.b.build()
    }

    pub fn plain_task(&mut self, flags: u32) -> u64 {
        self.task_of(TASK, flags)
    }

    pub fn task_of(&mut self, type_name: &str, flags: u32) -> u64 {
        self.b.declare_type(type_name, Some(TASK));
        let task = self.b.object(type_name);
        self.b.set_u32(task, "m_stateFlags", flags);
        task
    }

    /// A plain task whose delegate is `owner.method`.
    pub fn delegate_task(&mut self, owner: &str, method: &str, flags: u32) -> u64 {
        let task = self.plain_task(flags);
        let code = self.b.add_method(owner, method, true);
        let action = self.b.object(ACTION);
        self.b.set_u64(action, "_methodPtr", code.unwrap_or(0));
        self.b.set_object(task, "m_action", action);
        task
    }

    /// A .NET Core state machine box with the state machine stored inline.
    pub fn boxed(&mut self, state_machine_type: &str, state: i32) -> Boxed {
        let box_type = format!(
            "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1+AsyncStateMachineBox`1\
             [[System.Threading.Tasks.VoidTaskResult],[{state_machine_type}]]"
        );
        self.b.declare_type(&box_type, Some(TASK));
        let task = self.b.object(&box_type);
        self.b
            .set_u32(task, "m_stateFlags", TASK_STATE_WAITING_FOR_ACTIVATION);
        let state_machine = self.b.value(state_machine_type);
        self.b.set_i32(state_machine, "<>1__state", state);
        self.b.set_value(task, "StateMachine", state_machine);
        let move_next = self.b.add_method(state_machine_type, "MoveNext", true);
        Boxed {
            task,
            state_machine,
            move_next,
        }
    }

    fn builder_for(&mut self, task: u64) -> u64 {
        let inner = self.b.value(INNER_BUILDER);
        self.b.set_object(inner, "m_task", task);
        let builder = self.b.value(BUILDER);
        self.b.set_value(builder, "m_builder", inner);
        builder
    }

    fn runner_for(&mut self, state_machine: u64) -> u64 {
        let runner = self.b.object(RUNNER);
        self.b.set_object(runner, "m_stateMachine", state_machine);
        runner
    }

    /// A .NET Framework state machine: runner, state machine, builder, task.
    pub fn framework_machine(&mut self, state_machine_type: &str, state: i32) -> Machine {
        let task = self.plain_task(TASK_STATE_WAITING_FOR_ACTIVATION);
        let state_machine = self.b.object(state_machine_type);
        self.b.set_i32(state_machine, "<>1__state", state);
        let builder = self.builder_for(task);
        self.b.set_value(state_machine, "<>t__builder", builder);
        self.b.add_method(state_machine_type, "MoveNext", true);
        let runner = self.runner_for(state_machine);
        Machine {
            task,
            state_machine,
            runner,
        }
    }

    /// A state machine whose field names were lost; `hoisted` is a task held
    /// in a local declared before the builder.
    pub fn obfuscated_machine(
        &mut self,
        state_machine_type: &str,
        state: i32,
        hoisted: u64,
    ) -> Machine {
        let task = self.plain_task(TASK_STATE_WAITING_FOR_ACTIVATION);
        let state_machine = self.b.object(state_machine_type);
        self.b.set_i32(state_machine, "<>1__state", state);
        self.b.set_object(state_machine, "<>7__wrap1", hoisted);
        let builder = self.builder_for(task);
        self.b.set_value(state_machine, "__builder", builder);
        let runner = self.runner_for(state_machine);
        Machine {
            task,
            state_machine,
            runner,
        }
    }

    fn delegate(&mut self, target: u64) -> u64 {
        let action = self.b.object(ACTION);
        self.b.set_object(action, "_target", target);
        action
    }

    fn set_continuation(&mut self, task: u64, continuation: u64) {
        self.b.set_object(task, "m_continuationObject", continuation);
    }

    pub fn completed_sentinel(&mut self, task: u64) {
        let sentinel = self.b.object("System.Object");
        self.set_continuation(task, sentinel);
    }

    /// `await` continuation: `AwaitTaskContinuation.m_action._target`.
    pub fn await_continuation(&mut self, task: u64, target: u64) {
        let action = self.delegate(target);
        let continuation = self.b.object(AWAIT_CONTINUATION);
        self.b.set_object(continuation, "m_action", action);
        self.set_continuation(task, continuation);
    }

    /// A bare delegate in the continuation slot.
    pub fn action_continuation(&mut self, task: u64, target: u64) {
        let action = self.delegate(target);
        self.set_continuation(task, action);
    }

    /// `ContinueWith`: `StandardTaskContinuation.m_task.m_stateObject._target`.
    pub fn standard_continuation(&mut self, task: u64, target: u64) {
        let action = self.delegate(target);
        let continuation_task = self.b.object(CONTINUATION_TASK);
        self.b
            .set_object(continuation_task, "m_stateObject", action);
        let continuation = self.b.object(STANDARD_CONTINUATION);
        self.b.set_object(continuation, "m_task", continuation_task);
        self.set_continuation(task, continuation);
    }

    /// A delegate whose receiver is a `ContinuationWrapper` around `target`.
    pub fn wrapped_continuation(&mut self, task: u64, target: u64) {
        let inner = self.delegate(target);
        let wrapper = self.b.object(WRAPPER);
        self.b.set_object(wrapper, "_continuation", inner);
        let outer = self.delegate(wrapper);
        self.set_continuation(task, outer);
    }

    /// Several continuations stored in a `List<object>`.
    pub fn list_continuation(&mut self, task: u64, items: &[u64]) {
        let mut slots = items.to_vec();
        // Spare capacity past `_size` must be ignored.
        slots.extend([0, 0]);
        let array = self.b.array(OBJECT_ARRAY, &slots);
        let list = self.b.object(LIST);
        self.b.set_object(list, "_items", array);
        self.b.set_i32(list, "_size", items.len() as i32);
        self.set_continuation(task, list);
    }

    /// Stores a `TaskAwaiter` in `field` of an inline state machine; `0`
    /// leaves the awaiter consumed (all zero).
    pub fn awaiter(&mut self, state_machine: u64, field: &str, awaited: u64) -> u64 {
        let awaiter = self.b.value(TASK_AWAITER);
        self.b.set_object(awaiter, "m_task", awaited);
        self.b.set_value(state_machine, field, awaiter);
        awaiter
    }

    pub fn joinable(&mut self, wrapped: u64, state: u32) -> u64 {
        let joinable = self.b.object(JOINABLE);
        self.b.set_object(joinable, "wrappedTask", wrapped);
        self.b.set_u32(joinable, "state", state);
        joinable
    }

    /// A box whose state machine holds `joinable` in a hoisted local.
    pub fn joiner(&mut self, state_machine_type: &str, state: i32, joinable: u64) -> Boxed {
        let boxed = self.boxed(state_machine_type, state);
        self.b
            .set_object(boxed.state_machine, "<jtf>5__2", joinable);
        boxed
    }
}
