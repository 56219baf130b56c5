//! Supported languages and their fixed invocation recipes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ExecError;

/// Mount point of the job's source inside a container.
pub const CONTAINER_WORK_DIR: &str = "/work";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    R,
    Bash,
    Go,
    Julia,
    Cpp,
    Java,
}

/// How one language is materialized and launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipe {
    /// Name the source is written under.
    pub file_name: &'static str,
    pub image: &'static str,
    /// Shell command run inside the container, relative to `/work`.
    pub container_command: &'static str,
    /// Shell command run on the host from inside the job's temp directory.
    /// `{heap_mb}` is replaced with the job's memory budget.
    pub host_command: &'static str,
    /// Extra data-segment room the runtime or toolchain needs on the host
    /// before the user's program allocates anything.
    pub host_memory_allowance_mb: u64,
    /// Text the runtime writes to stderr when an allocation fails.
    pub out_of_memory_marker: &'static str,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Javascript,
        Language::R,
        Language::Bash,
        Language::Go,
        Language::Julia,
        Language::Cpp,
        Language::Java,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::R => "r",
            Language::Bash => "bash",
            Language::Go => "go",
            Language::Julia => "julia",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    pub fn recipe(&self) -> Recipe {
        match self {
            Language::Python => Recipe {
                file_name: "main.py",
                image: "python:3.11-alpine",
                container_command: "python3 /work/main.py",
                host_command: "python3 main.py",
                host_memory_allowance_mb: 0,
                out_of_memory_marker: "MemoryError",
            },
            Language::Javascript => Recipe {
                file_name: "main.js",
                image: "node:20-alpine",
                container_command: "node /work/main.js",
                host_command: "node main.js",
                host_memory_allowance_mb: 128,
                out_of_memory_marker: "JavaScript heap out of memory",
            },
            Language::R => Recipe {
                file_name: "main.R",
                image: "r-base:4.3.1",
                container_command: "Rscript /work/main.R",
                host_command: "Rscript main.R",
                host_memory_allowance_mb: 64,
                out_of_memory_marker: "cannot allocate vector of size",
            },
            Language::Bash => Recipe {
                file_name: "main.sh",
                image: "bash:5.2",
                container_command: "bash /work/main.sh",
                host_command: "bash main.sh",
                host_memory_allowance_mb: 0,
                out_of_memory_marker: "xmalloc: cannot allocate",
            },
            Language::Go => Recipe {
                file_name: "main.go",
                image: "golang:1.22-alpine",
                container_command: "go run /work/main.go",
                host_command: "go run main.go",
                host_memory_allowance_mb: 512,
                out_of_memory_marker: "fatal error: runtime: out of memory",
            },
            Language::Julia => Recipe {
                file_name: "main.jl",
                image: "julia:1.10",
                container_command: "julia /work/main.jl",
                host_command: "julia main.jl",
                host_memory_allowance_mb: 512,
                out_of_memory_marker: "OutOfMemoryError()",
            },
            Language::Cpp => Recipe {
                file_name: "main.cpp",
                image: "gcc:13",
                container_command: "g++ -O2 -o /tmp/main /work/main.cpp && /tmp/main",
                host_command: "g++ -O2 -o ./main main.cpp && ./main",
                host_memory_allowance_mb: 256,
                out_of_memory_marker: "std::bad_alloc",
            },
            Language::Java => Recipe {
                file_name: "Main.java",
                image: "eclipse-temurin:21-jdk",
                container_command: "java /work/Main.java",
                host_command: "java -Xmx{heap_mb}m -XX:+UseSerialGC -XX:TieredStopAtLevel=1 Main.java",
                host_memory_allowance_mb: 384,
                out_of_memory_marker: "java.lang.OutOfMemoryError",
            },
        }
    }

    /// Whether a failed run's stderr carries this runtime's allocation-failure report.
    ///
    /// Python's `MemoryError` must start a line (the last line of a traceback);
    /// the other runtimes embed their marker in a longer fatal-error line.
    pub fn reports_out_of_memory(&self, stderr: &str) -> bool {
        let marker = self.recipe().out_of_memory_marker;
        match self {
            Language::Python => stderr
                .lines()
                .any(|line| line.trim_start().starts_with(marker)),
            _ => stderr.contains(marker),
        }
    }

    /// Hello-world program used by the smoke check.
    pub fn smoke_program(&self) -> &'static str {
        match self {
            Language::Python => "print(\"Hello from Python\")",
            Language::Javascript => "console.log(\"Hello from JavaScript\")",
            Language::R => "cat(\"Hello from R\\n\")",
            Language::Bash => "echo \"Hello from Bash\"",
            Language::Go => {
                "package main\nimport \"fmt\"\nfunc main(){fmt.Println(\"Hello from Go\")}\n"
            }
            Language::Julia => "println(\"Hello from Julia\")\n",
            Language::Cpp => "#include <iostream>\nint main(){std::cout<<\"Hello from C++\\n\";}",
            Language::Java => {
                "public class Main{public static void main(String[] a){System.out.println(\"Hello from Java\");}}"
            }
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::Javascript),
            "r" => Ok(Language::R),
            "bash" | "sh" => Ok(Language::Bash),
            "go" | "golang" => Ok(Language::Go),
            "julia" => Ok(Language::Julia),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            _ => Err(ExecError::UnsupportedLanguage(s.to_string())),
        }
    }
}
