#[cfg(test)]
mod test {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;
    use std::process::Command;

    #[test]
    fn unknown_flag_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("kv-cli")?;

        cmd.arg("--not-a-real-flag");
        cmd.assert()
            .failure()
            .stderr(predicate::str::contains("unexpected argument"));

        Ok(())
    }

    #[test]
    fn help_lists_server_url_and_tenant_flags() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("kv-cli")?;

        cmd.arg("--help");
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("--server-url"))
            .stdout(predicate::str::contains("--tenant"));

        Ok(())
    }

    #[test]
    fn non_interactive_query_against_unreachable_server_fails_cleanly() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("kv-cli")?;

        cmd.arg("--non-interactive")
            .arg("--server-url")
            .arg("http://127.0.0.1:1")
            .arg("--query=show buckets");
        cmd.assert().failure();

        Ok(())
    }
}
