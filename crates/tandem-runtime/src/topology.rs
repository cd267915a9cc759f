//! Builds the step table for a flow out of a step-definition tree.
//!
//! Ids are path strings: the root is `_root` and every child appends
//! `.<action>` to its parent's id. The breadth-first build order doubles as
//! the forward dispatch ordering (ascending depth, definition order within a
//! level).

use std::collections::{HashMap, HashSet, VecDeque};

use tandem_core::definition::StepDefinition;
use tandem_core::error::{Result, SagaError};
use tandem_core::flow::Flow;
use tandem_core::payload::KEY_SEPARATOR;
use tandem_core::step::{Step, ID_SEPARATOR, ROOT_ID};

/// A built step table plus the two precomputed dispatch orderings.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Step table keyed by path id.
    pub steps: HashMap<String, Step>,
    /// All step ids by ascending depth, root first.
    pub invoke_order: Vec<String>,
    /// All step ids by descending depth, leaves first.
    pub compensate_order: Vec<String>,
}

fn action_name(definition: &StepDefinition) -> Result<&str> {
    let action = definition
        .action
        .as_deref()
        .ok_or_else(|| SagaError::InvalidAction("step definition without action".into()))?;
    if action.is_empty() {
        return Err(SagaError::InvalidAction("empty action name".into()));
    }
    if action.contains(ID_SEPARATOR) || action.contains(KEY_SEPARATOR) {
        return Err(SagaError::InvalidAction(format!(
            "action '{action}' must not contain '{ID_SEPARATOR}' or '{KEY_SEPARATOR}'"
        )));
    }
    Ok(action)
}

/// Build the step table for `definition` breadth-first.
pub fn build(definition: &StepDefinition) -> Result<Topology> {
    let mut steps = HashMap::new();
    let mut invoke_order = Vec::new();
    let mut seen_actions: HashSet<String> = HashSet::new();

    let mut queue: VecDeque<(&StepDefinition, String, u32)> = VecDeque::new();
    queue.push_back((definition, ROOT_ID.to_string(), 0));

    while let Some((def, id, depth)) = queue.pop_front() {
        let action = if id == ROOT_ID {
            String::new()
        } else {
            let action = action_name(def)?;
            if !seen_actions.insert(action.to_string()) {
                return Err(SagaError::DuplicateAction(action.to_string()));
            }
            action.to_string()
        };

        let mut next = Vec::with_capacity(def.next.len());
        for child in &def.next {
            let child_action = action_name(child)?;
            let child_id = format!("{id}{ID_SEPARATOR}{child_action}");
            next.push(child_id.clone());
            queue.push_back((child, child_id, depth + 1));
        }

        invoke_order.push(id.clone());
        steps.insert(id.clone(), Step::new(id, action, depth, next, def.policy.clone()));
    }

    let compensate_order: Vec<String> = invoke_order.iter().rev().cloned().collect();

    Ok(Topology {
        steps,
        invoke_order,
        compensate_order,
    })
}

/// Recompute structural fields on a rehydrated flow.
///
/// Runtime attributes (states, counters, responses) are preserved; only
/// `depth`, `next` and the policy are refreshed from the stored definition.
/// Returns the dispatch orderings.
pub fn rehydrate(flow: &mut Flow) -> Result<(Vec<String>, Vec<String>)> {
    let topology = build(&flow.definition)?;
    for (id, fresh) in topology.steps {
        match flow.steps.get_mut(&id) {
            Some(existing) => {
                existing.depth = fresh.depth;
                existing.next = fresh.next;
                existing.policy = fresh.policy;
            }
            None => {
                flow.steps.insert(id, fresh);
            }
        }
    }
    Ok((topology.invoke_order, topology.compensate_order))
}
