//! Bootstrap script and dependency manifest generation.
//!
//! Each run's workspace gets a generated `runner.py` that drives the agent
//! inside the container: it builds the input document, snapshots the file
//! context under git so a diff can be derived later, invokes `agent_main`,
//! and always writes one structured `output.json`. The bootstrap exits zero
//! regardless of agent outcome; agent failure is the `success: false` flag
//! inside the output document, so non-zero exits stay reserved for
//! orchestration faults.

/// Dependency manifest installed in every sandbox before the agent runs.
pub const REQUIREMENTS: &str = "\
requests>=2.31.0
pytest>=7.4.0
numpy>=1.24.0
pandas>=2.0.0
scipy>=1.10.0
matplotlib>=3.7.0
scikit-learn>=1.3.0
python-dotenv>=1.0.0
aiohttp>=3.9.0
beautifulsoup4>=4.12.0
lxml>=4.9.0
";

const BOOTSTRAP_TEMPLATE: &str = r#"import json
import os
import subprocess
import sys
import traceback

proxy_url = os.environ.get("AGENT_PROXY_URL", __PROXY_DEFAULT__)
run_id = __RUN_ID__
has_files = __HAS_FILES__


def write_output(output):
    with open("/workspace/output.json", "w") as f:
        json.dump(output, f, indent=2, default=str)


try:
    import agent
except ImportError as e:
    print("error importing agent: %s" % e, file=sys.stderr)
    write_output({"error": "failed to import agent: %s" % e, "success": False})
    sys.exit(0)

input_dict = {
    "problem_statement": __PROBLEM__,
    "run_id": run_id,
    "proxy_url": proxy_url,
}

if has_files and os.path.exists("/workspace/files"):
    os.chdir("/workspace/files")
    # Baseline snapshot so a structural diff can be derived after the run
    if not os.path.exists(".git"):
        os.system("git init -q")
        os.system("git config user.email 'runner@agent-harbor.local'")
        os.system("git config user.name 'Agent Harbor Runner'")
        os.system("git add -A")
        os.system("git commit -q -m 'baseline'")

try:
    if hasattr(agent, "agent_main"):
        result = agent.agent_main(input_dict, repo_dir="." if has_files else "/workspace")
    else:
        raise RuntimeError("unsupported agent: no agent_main entry point")

    patch = None
    if isinstance(result, dict) and "patch" in result:
        patch = result["patch"]
    elif isinstance(result, str):
        patch = result

    if not patch and has_files:
        try:
            diff = subprocess.run(["git", "diff", "HEAD"], capture_output=True, text=True)
            if diff.returncode == 0 and diff.stdout:
                patch = diff.stdout
        except Exception:
            pass

    output = {"result": result, "patch": patch, "success": True}
except Exception as e:
    print("error running agent: %s" % e, file=sys.stderr)
    print(traceback.format_exc(), file=sys.stderr)
    output = {"error": str(e), "traceback": traceback.format_exc(), "success": False}

write_output(output)
print("agent execution completed")
sys.exit(0)
"#;

/// Renders the bootstrap script for one run.
///
/// The problem statement and run id are embedded as JSON string literals,
/// which are valid Python literals, so no manual escaping is needed. The
/// external inference endpoint is deliberately absent; the script only ever
/// sees the internal proxy URL.
pub fn render_bootstrap(
    problem_statement: &str,
    run_id: &str,
    proxy_internal_url: &str,
    has_files: bool,
) -> String {
    BOOTSTRAP_TEMPLATE
        .replace(
            "__PROBLEM__",
            &serde_json::to_string(problem_statement).unwrap_or_else(|_| "\"\"".to_string()),
        )
        .replace(
            "__RUN_ID__",
            &serde_json::to_string(run_id).unwrap_or_else(|_| "\"\"".to_string()),
        )
        .replace(
            "__PROXY_DEFAULT__",
            &serde_json::to_string(proxy_internal_url).unwrap_or_else(|_| "\"\"".to_string()),
        )
        .replace("__HAS_FILES__", if has_files { "True" } else { "False" })
}

/// Static capability check: does the artifact declare a top-level
/// `agent_main` entry point?
pub fn has_agent_main(source: &str) -> bool {
    source.lines().any(|line| {
        line.starts_with("def agent_main(") || line.starts_with("async def agent_main(")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_embeds_run_id_and_proxy() {
        let script = render_bootstrap("fix it", "run-123", "http://proxy:8001", false);
        assert!(script.contains("run_id = \"run-123\""));
        assert!(script.contains("\"http://proxy:8001\""));
        assert!(script.contains("has_files = False"));
    }

    #[test]
    fn test_bootstrap_escapes_problem_statement() {
        let problem = "line one\nwith \"quotes\" and \\backslash";
        let script = render_bootstrap(problem, "run-1", "http://proxy:8001", true);
        // The statement is embedded as a JSON string literal
        assert!(script.contains("\"line one\\nwith \\\"quotes\\\" and \\\\backslash\""));
        assert!(script.contains("has_files = True"));
    }

    #[test]
    fn test_bootstrap_always_exits_zero() {
        let script = render_bootstrap("p", "r", "http://proxy:8001", false);
        assert!(script.contains("sys.exit(0)"));
        assert!(!script.contains("sys.exit(1)"));
    }

    #[test]
    fn test_bootstrap_derives_patch_from_git_diff() {
        let script = render_bootstrap("p", "r", "http://proxy:8001", true);
        assert!(script.contains("git init -q"));
        assert!(script.contains("\"diff\", \"HEAD\""));
    }

    #[test]
    fn test_has_agent_main() {
        assert!(has_agent_main("def agent_main(input_dict, repo_dir=None):\n    pass\n"));
        assert!(has_agent_main("import os\n\nasync def agent_main(input_dict):\n    pass\n"));
        // Indented (nested) definitions do not count as a declared entry point
        assert!(!has_agent_main("class A:\n    def agent_main(self):\n        pass\n"));
        assert!(!has_agent_main("def main():\n    pass\n"));
        assert!(!has_agent_main(""));
    }

    #[test]
    fn test_requirements_manifest_includes_core_deps() {
        assert!(REQUIREMENTS.contains("requests"));
        assert!(REQUIREMENTS.contains("pytest"));
        assert!(REQUIREMENTS.lines().count() >= 10);
    }
}
