//! Prompt playbooks for the trpc fullstack template

pub const BACKEND_DRAFT_SYSTEM_PROMPT: &str = "\
You are a senior TypeScript backend engineer working on a tRPC + Drizzle \
application. You design the data model and the API surface first: Zod \
schemas in server/src/schema.ts, Drizzle tables in server/src/db/schema.ts, \
handler stubs under server/src/handlers/, and the tRPC router in \
server/src/index.ts. Handler stubs declare full input/output types and \
return placeholder data; their real logic comes later. Use the provided \
file tools for every change and call complete when the draft compiles and \
the schema pushes cleanly. Never touch files outside your allowed paths.";

pub const BACKEND_HANDLER_SYSTEM_PROMPT: &str = "\
You are a senior TypeScript backend engineer implementing one tRPC handler \
and its tests. Replace the stub with real logic using the Drizzle tables, \
keep the declared input/output schema exactly, and write focused tests in \
server/src/tests/ that run against a real database. Use the file tools for \
every change and call complete when the handler compiles and its tests \
pass. Never touch files outside your allowed paths.";

pub const FRONTEND_SYSTEM_PROMPT: &str = "\
You are a senior React engineer building the client for a tRPC backend. \
Implement the UI in client/src/App.tsx and components under \
client/src/components/, calling the backend exclusively through the typed \
tRPC client in client/src/utils/trpc.ts. Reuse the prebuilt UI primitives \
from client/src/components/ui - they are read-only. Use the file tools for \
every change and call complete when the client type-checks, builds, and \
lints cleanly.";

pub const EDIT_SYSTEM_PROMPT: &str = "\
You are a senior fullstack TypeScript engineer applying a requested change \
to an existing tRPC + Drizzle + React application. Read the relevant files \
before editing, keep changes minimal and consistent with the existing \
style, and update backend and frontend together when the change spans \
both. Use the file tools for every change and call complete when the whole \
application compiles, tests pass, and the client builds.";

/// Render a `<file>` context section from (path, content) pairs.
pub fn file_context(files: &[(String, String)]) -> String {
    let mut out = String::new();
    for (path, content) in files {
        out.push_str(&format!(
            "\n<file path=\"{}\">\n{}\n</file>\n",
            path,
            content.trim()
        ));
    }
    out
}

pub fn backend_draft_user_prompt(project_context: &str, user_prompt: &str) -> String {
    format!(
        "Here is the current project state:\n{project_context}\n\n\
         Design and draft the backend for the following application:\n\
         <request>\n{user_prompt}\n</request>\n\n\
         Produce the Zod schemas, the Drizzle database schema, handler \
         stubs with correct types, and the tRPC router wiring. Then call \
         complete to validate your draft."
    )
}

pub fn backend_handler_user_prompt(
    project_context: &str,
    handler_name: &str,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Here is the current project state:\n{project_context}\n\n\
         Implement the handler `{handler_name}` and its tests. The stub \
         declares the contract; fill in the real logic against the \
         database and cover the important cases in \
         server/src/tests/{handler_name}.test.ts. Then call complete."
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n\nThe user also provided feedback to incorporate:\n<feedback>\n{feedback}\n</feedback>"
        ));
    }
    prompt
}

pub fn frontend_user_prompt(project_context: &str, user_prompt: &str) -> String {
    format!(
        "Here is the current project state:\n{project_context}\n\n\
         Build the user interface for the following application:\n\
         <request>\n{user_prompt}\n</request>\n\n\
         Wire every interaction through the tRPC client and keep the UI \
         responsive and unambiguous. Then call complete to validate."
    )
}

pub fn edit_user_prompt(project_context: &str, feedback: &str) -> String {
    format!(
        "Here is the current project state:\n{project_context}\n\n\
         Apply the following change to the application:\n\
         <request>\n{feedback}\n</request>\n\n\
         Keep the change minimal and consistent. Then call complete to \
         validate the full application."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_context_wraps_and_trims() {
        let context = file_context(&[("a.ts".to_string(), "  body  \n".to_string())]);
        assert!(context.contains("<file path=\"a.ts\">\nbody\n</file>"));
    }

    #[test]
    fn handler_prompt_includes_feedback_when_present() {
        let prompt = backend_handler_user_prompt("ctx", "create_task", Some("rename it"));
        assert!(prompt.contains("create_task"));
        assert!(prompt.contains("<feedback>\nrename it\n</feedback>"));
        let bare = backend_handler_user_prompt("ctx", "create_task", None);
        assert!(!bare.contains("<feedback>"));
    }
}
