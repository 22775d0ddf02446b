//! Skill templates bundled into the binary.

pub const BRIEF: &str = r#"---
name: brief
description: Write a feature brief for a task.
---

# Brief: $TASK_TITLE

You are writing the brief for a development task. Do not write any code.

## Task
**Title:** $TASK_TITLE
**Context:** $TASK_CONTEXT

## Required Output
Create `$TASK_DOCS_PATH/README.md` containing:
1. Problem statement
2. Goals and non-goals
3. User-facing behaviour
4. Open questions

Keep it short and concrete. Only create the brief."#;

pub const PLAN: &str = r#"---
name: plan
description: Turn a task brief into an implementation plan.
---

# Plan: $TASK_TITLE

Read the brief at `$TASK_DOCS_PATH/README.md` and produce an implementation plan.

## Task
**Title:** $TASK_TITLE
**Context:** $TASK_CONTEXT

## Required Output
Create `$TASK_DOCS_PATH/PLAN.md` with:
1. Files to modify or create
2. Ordered implementation steps as a checklist
3. Risks and how to test them

Do NOT implement anything yet. Only create the plan."#;

pub const EXECUTE: &str = r#"---
name: execute
description: Implement a task according to its plan.
---

# Execute: $TASK_TITLE

Implement the task described in `$TASK_DOCS_PATH/README.md` following
`$TASK_DOCS_PATH/PLAN.md`.

## Instructions
1. Work through the plan step by step
2. Check off each step in PLAN.md as it is completed
3. Write tests where applicable
4. Summarize what changed when done

Work inside the repository at `$WORKSPACE_PATH`."#;

/// Names of every bundled skill, in pipeline order.
pub const BUNDLED_SKILLS: [&str; 3] = ["brief", "plan", "execute"];

pub fn bundled(name: &str) -> Option<&'static str> {
    match name {
        "brief" => Some(BRIEF),
        "plan" => Some(PLAN),
        "execute" => Some(EXECUTE),
        _ => None,
    }
}
