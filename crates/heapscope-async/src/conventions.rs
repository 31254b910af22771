//! Names the host runtime uses for its async machinery.
//!
//! Everything the analysis matches by name lives here so a different runtime
//! version (or a renamed field after a servicing update) is a table change,
//! not a code change.

use facet::Facet;

/// Runtime naming conventions. `Default` matches the .NET task runtime.
///
/// Facet-derived so a whole table can be loaded from JSON.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConventions {
    // Operations
    pub operation_type: String,
    pub status_flags_field: String,
    pub continuation_field: String,
    pub action_field: String,
    pub state_object_field: String,
    pub inner_operation_field: String,

    // Continuation shapes
    pub continuation_list_prefix: String,
    pub list_items_field: String,
    pub list_size_field: String,
    pub completion_sentinel_type: String,
    pub delegate_target_field: String,
    pub delegate_method_fields: Vec<String>,
    pub wrapped_continuation_field: String,

    // State machines
    pub box_type_marker: String,
    pub box_state_machine_field: String,
    pub runner_type: String,
    pub runner_state_machine_field: String,
    pub state_field: String,
    pub builder_field: String,
    pub builder_type_marker: String,
    pub sub_builder_field: String,
    pub builder_task_field: String,
    pub resumption_method: String,
    pub awaiter_field_prefix: String,
    pub awaiter_operation_field: String,
    /// Whether a state machine without a usable builder field is searched
    /// structurally for its operation.
    pub structural_scan: bool,

    // Joinable operations and synchronous blocking
    pub joinable_type: String,
    pub joinable_wrapped_field: String,
    pub joinable_state_field: String,
    pub joinable_blocking_mask: u32,
    pub sync_join_method: String,
    pub max_stack_frames: usize,
}

impl Default for RuntimeConventions {
    fn default() -> Self {
        Self {
            operation_type: "System.Threading.Tasks.Task".to_string(),
            status_flags_field: "m_stateFlags".to_string(),
            continuation_field: "m_continuationObject".to_string(),
            action_field: "m_action".to_string(),
            state_object_field: "m_stateObject".to_string(),
            inner_operation_field: "m_task".to_string(),

            continuation_list_prefix: "System.Collections.Generic.List<".to_string(),
            list_items_field: "_items".to_string(),
            list_size_field: "_size".to_string(),
            completion_sentinel_type: "System.Object".to_string(),
            delegate_target_field: "_target".to_string(),
            delegate_method_fields: vec!["_methodPtr".to_string(), "_methodPtrAux".to_string()],
            wrapped_continuation_field: "_continuation".to_string(),

            box_type_marker: "AsyncStateMachineBox".to_string(),
            box_state_machine_field: "StateMachine".to_string(),
            runner_type: "System.Runtime.CompilerServices.AsyncMethodBuilderCore+MoveNextRunner"
                .to_string(),
            runner_state_machine_field: "m_stateMachine".to_string(),
            state_field: "<>1__state".to_string(),
            builder_field: "<>t__builder".to_string(),
            builder_type_marker: "MethodBuilder".to_string(),
            sub_builder_field: "m_builder".to_string(),
            builder_task_field: "m_task".to_string(),
            resumption_method: "MoveNext".to_string(),
            awaiter_field_prefix: "<>u__".to_string(),
            awaiter_operation_field: "m_task".to_string(),
            structural_scan: true,

            joinable_type: "Microsoft.VisualStudio.Threading.JoinableTask".to_string(),
            joinable_wrapped_field: "wrappedTask".to_string(),
            joinable_state_field: "state".to_string(),
            // SynchronouslyBlockingThreadPool | SynchronouslyBlockingMainThread
            joinable_blocking_mask: 0x10 | 0x20,
            sync_join_method: "CompleteOnCurrentThread".to_string(),
            max_stack_frames: 50,
        }
    }
}
