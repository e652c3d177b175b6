//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Kiln with state isolated under `home`
    fn kiln(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_HOME", home.path().join("state"))
            .env_remove("KILN_CONFIG")
            .arg("--no-local");
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Run compiled-language scripts"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_honors_flag() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("custom.toml");
        kiln(&home)
            .arg("-c")
            .arg(&path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("-c")
            .arg(home.path().join("config.toml"))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[compiler]"));
    }

    #[test]
    fn config_set_rejects_unknown_key() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("-c")
            .arg(home.path().join("config.toml"))
            .args(["config", "set", "compiler.colour", "red"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn ping_without_server_fails() {
        let home = TempDir::new().unwrap();
        let port = free_port();
        kiln(&home)
            .arg("-c")
            .arg(home.path().join("config.toml"))
            .args(["server", "ping", "--port", &port.to_string()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unreachable"));
    }

    #[test]
    fn server_list_empty() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("-c")
            .arg(home.path().join("config.toml"))
            .args(["server", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn missing_script_fails() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("-c")
            .arg(home.path().join("config.toml"))
            .args(["build", "--no-server", "nope.c"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Script not found"));
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[cfg(unix)]
    mod builds {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        /// A "compiler" that turns every `echo` line of its sources into a
        /// shell script and records each invocation in `calls`
        const FAKE_COMPILER: &str = r#"#!/bin/sh
echo x >> "$(dirname "$0")/calls"
out=""
srcs=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -*) shift ;;
    *)
      if grep -q SYNTAX_ERROR "$1"; then
        echo "$1:2:1: error: unknown token" >&2
        exit 1
      fi
      srcs="$srcs $1"; shift ;;
  esac
done
{ echo '#!/bin/sh'; cat $srcs | grep '^echo'; } > "$out"
chmod +x "$out"
"#;

        struct Project {
            home: TempDir,
            config: PathBuf,
        }

        impl Project {
            fn new(server: &str) -> Self {
                let home = TempDir::new().unwrap();
                let compiler = home.path().join("fakecc");
                std::fs::write(&compiler, FAKE_COMPILER).unwrap();
                std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755))
                    .unwrap();

                let config = home.path().join("config.toml");
                std::fs::write(
                    &config,
                    format!(
                        "[compiler]\nprogram = \"{}\"\ndebug_args = []\nrelease_args = []\n\n[server]\n{}\n",
                        compiler.display(),
                        server
                    ),
                )
                .unwrap();

                Self { home, config }
            }

            fn write(&self, name: &str, content: &str) -> PathBuf {
                let path = self.home.path().join(name);
                std::fs::write(&path, content).unwrap();
                path
            }

            fn kiln(&self) -> Command {
                let mut cmd = kiln(&self.home);
                cmd.arg("-c").arg(&self.config).current_dir(self.home.path());
                cmd
            }

            fn calls(&self) -> usize {
                std::fs::read_to_string(self.home.path().join("calls"))
                    .map(|s| s.lines().count())
                    .unwrap_or(0)
            }
        }

        fn script(project: &Project) -> PathBuf {
            project.write("util.c", "echo from util\n");
            project.write("hello.c", "//kiln_inc util.c\necho hello \"$@\"\n")
        }

        #[test]
        fn run_builds_once_then_hits_cache() {
            let project = Project::new("enabled = false");
            let hello = script(&project);

            project
                .kiln()
                .arg("run")
                .arg(&hello)
                .args(["--", "world"])
                .assert()
                .success()
                .stdout(predicate::str::contains("from util"))
                .stdout(predicate::str::contains("hello world"));

            project
                .kiln()
                .arg("run")
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("hello"));

            assert_eq!(project.calls(), 1);
        }

        #[test]
        fn edit_invalidates_cache() {
            let project = Project::new("enabled = false");
            let hello = script(&project);

            project.kiln().arg("build").arg(&hello).assert().success();
            project.write("util.c", "echo changed\n");
            project
                .kiln()
                .arg("run")
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("changed"));

            assert_eq!(project.calls(), 2);
        }

        #[test]
        fn force_rebuilds() {
            let project = Project::new("enabled = false");
            let hello = script(&project);

            project.kiln().arg("build").arg(&hello).assert().success();
            project
                .kiln()
                .args(["build", "--force"])
                .arg(&hello)
                .assert()
                .success();

            assert_eq!(project.calls(), 2);
        }

        #[test]
        fn build_prints_artifact_and_copies_output() {
            let project = Project::new("enabled = false");
            let hello = script(&project);

            project
                .kiln()
                .args(["build", "-o", "out/hello"])
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("hello"));

            assert!(project.home.path().join("out/hello").is_file());
        }

        #[test]
        fn compile_error_reported_and_not_cached() {
            let project = Project::new("enabled = false");
            let broken = project.write("broken.c", "echo a\nSYNTAX_ERROR\n");

            project
                .kiln()
                .arg("build")
                .arg(&broken)
                .assert()
                .failure()
                .stderr(predicate::str::contains("unknown token"))
                .stderr(predicate::str::contains("Compilation failed"));

            project.write("broken.c", "echo fixed\n");
            project
                .kiln()
                .arg("run")
                .arg(&broken)
                .assert()
                .success()
                .stdout(predicate::str::contains("fixed"));

            assert_eq!(project.calls(), 2);
        }

        #[test]
        fn missing_include_reported() {
            let project = Project::new("enabled = false");
            let hello = project.write("hello.c", "//kiln_inc nowhere.c\necho hi\n");

            project
                .kiln()
                .arg("build")
                .arg(&hello)
                .assert()
                .failure()
                .stderr(predicate::str::contains("nowhere.c"));

            assert_eq!(project.calls(), 0);
        }

        #[test]
        fn script_exit_code_forwarded() {
            let project = Project::new("enabled = false");
            let failing = project.write("fail.c", "echo about to fail; exit 7\n");

            project
                .kiln()
                .arg("run")
                .arg(&failing)
                .assert()
                .code(7)
                .stdout(predicate::str::contains("about to fail"));
        }

        #[test]
        fn cache_list_and_clear() {
            let project = Project::new("enabled = false");
            let hello = script(&project);
            project.kiln().arg("build").arg(&hello).assert().success();

            project
                .kiln()
                .args(["cache", "list", "--format", "json"])
                .assert()
                .success()
                .stdout(predicate::str::contains("hello.c"));

            project
                .kiln()
                .args(["cache", "clear", "--yes"])
                .assert()
                .success()
                .stdout(predicate::str::contains("Cleared 1"));

            project
                .kiln()
                .args(["cache", "list", "--format", "json"])
                .assert()
                .success()
                .stdout(predicate::str::contains("[]"));
        }

        #[test]
        fn inspect_shows_sources() {
            let project = Project::new("enabled = false");
            let hello = script(&project);

            project
                .kiln()
                .args(["inspect", "--format", "json"])
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("util.c"))
                .stdout(predicate::str::contains("\"artifact\": null"));
        }

        fn wait_for_ping(project: &Project, port: &str, listening: bool) {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
            loop {
                let ok = project
                    .kiln()
                    .args(["server", "ping", "--port", port])
                    .output()
                    .unwrap()
                    .status
                    .success();
                if ok == listening {
                    return;
                }
                assert!(std::time::Instant::now() < deadline, "ping never became {listening}");
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }

        fn stop(project: &Project, port: &str) {
            project
                .kiln()
                .args(["server", "stop", "--port", port])
                .assert()
                .success();
            wait_for_ping(project, port, false);
        }

        #[test]
        fn server_lifecycle() {
            let port = free_port().to_string();
            let project = Project::new("idle_timeout_secs = 30");
            let hello = script(&project);

            project
                .kiln()
                .args(["server", "start", "--port", &port])
                .assert()
                .success();
            wait_for_ping(&project, &port, true);

            // Second start finds the running server
            project
                .kiln()
                .args(["server", "start", "--port", &port])
                .assert()
                .success();
            project
                .kiln()
                .args(["server", "list", "--format", "plain"])
                .assert()
                .success()
                .stdout(predicate::str::contains(port.as_str()));

            project
                .kiln()
                .args(["run", "--port", &port])
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("hello"));

            stop(&project, &port);
        }

        #[test]
        fn run_auto_starts_server() {
            let port = free_port().to_string();
            let project = Project::new("idle_timeout_secs = 30");
            let hello = script(&project);

            project
                .kiln()
                .args(["run", "--port", &port])
                .arg(&hello)
                .assert()
                .success()
                .stdout(predicate::str::contains("from util"));
            wait_for_ping(&project, &port, true);

            stop(&project, &port);
        }
    }
}
