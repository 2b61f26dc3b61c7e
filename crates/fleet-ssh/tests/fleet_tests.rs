//! Fleet coordination over scripted hosts.

mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeConnector, HostScript, Reply};
use fleet_ssh::result::{FAILURE_RETURN_CODE, TIMEOUT_RETURN_CODE};
use fleet_ssh::{
    DirRemoval, ExecutionStatus, FleetBuilder, FleetError, FleetSettings, HostOutcome,
    PutOptions, overall_status,
};

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|h| (*h).to_string()).collect()
}

#[tokio::test]
async fn all_hosts_reachable() {
    let connector = FakeConnector::new("deploy");
    let fleet = FleetBuilder::new(hosts(&["web1", "web2", "db1:2222"]))
        .open_with(connector)
        .await
        .unwrap();

    assert_eq!(fleet.connected_count(), 3);
    let results = fleet.run("whoami", None, false).await;
    assert_eq!(results.len(), 3);
    for host in ["web1", "web2", "db1:2222"] {
        let result = results[host].ok().unwrap();
        assert_eq!(result.stdout, "deploy\n");
        assert_eq!(result.return_code, 0);
        assert!(result.succeeded);
    }
    assert_eq!(overall_status(&results, false), ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn no_reachable_hosts_reports_every_error() {
    let connector = FakeConnector::new("deploy")
        .host("h1", HostScript::unreachable())
        .host("h2", HostScript::unreachable());

    let err = FleetBuilder::new(hosts(&["h1", "h2"]))
        .open_with(connector)
        .await
        .unwrap_err();

    let FleetError::NoHostsReachable { hosts, details } = &err else {
        panic!("expected NoHostsReachable, got {err:?}");
    };
    assert_eq!(hosts, &["h1".to_string(), "h2".to_string()]);
    assert!(details.contains("Failed connecting to host h1."));
    assert!(details.contains("Failed connecting to host h2."));
    assert!(err.to_string().starts_with("Unable to connect to any one of the hosts: h1, h2."));
}

#[tokio::test]
async fn partial_failure_keeps_an_entry_per_host() {
    let connector = FakeConnector::new("deploy")
        .host("h2", HostScript::unreachable())
        .host("h4", HostScript::unreachable());
    let names = hosts(&["h1", "h2", "h3", "h4", "h5"]);

    let mut fleet = FleetBuilder::new(names.clone())
        .connect(false)
        .build_with(connector)
        .unwrap();
    let connected = fleet.connect(false).await.unwrap();
    assert_eq!(connected.len(), 5);
    assert_eq!(fleet.connected_count(), 3);
    assert_eq!(connected["h1"].ok().unwrap().message, "Connected to host.");

    let results = fleet.run("uptime", None, false).await;
    assert_eq!(results.len(), 5);
    for bad in ["h2", "h4"] {
        let err = results[bad].err().unwrap();
        assert!(err.failed);
        assert!(!err.timeout);
        assert_eq!(err.return_code, FAILURE_RETURN_CODE);
        assert!(err.error.starts_with(&format!("Failed connecting to host {bad}.")));
        assert!(err.traceback.contains("Connection refused"));
    }
    assert_eq!(overall_status(&results, false), ExecutionStatus::Failed);
    assert_eq!(overall_status(&results, true), ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn fleet_status_follows_partial_failure_setting() {
    let connector = FakeConnector::new("deploy").host("h2", HostScript::unreachable());
    let settings = FleetSettings {
        allow_partial_failure: true,
        ..FleetSettings::default()
    };
    let fleet = FleetBuilder::new(hosts(&["h1", "h2"]))
        .settings(settings)
        .open_with(connector)
        .await
        .unwrap();

    let results = fleet.run("uptime", None, false).await;
    assert_eq!(fleet.status(&results), ExecutionStatus::Succeeded);

    let strict = FleetBuilder::new(hosts(&["h1", "h2"]))
        .settings(FleetSettings::default())
        .open_with(FakeConnector::new("deploy").host("h2", HostScript::unreachable()))
        .await
        .unwrap();
    let results = strict.run("uptime", None, false).await;
    assert_eq!(strict.status(&results), ExecutionStatus::Failed);
}

#[tokio::test]
async fn bad_hosts_are_never_retried() {
    let connector = FakeConnector::new("deploy").host("down", HostScript::unreachable());
    let ledger = std::sync::Arc::clone(&connector.ledger);

    let mut fleet = FleetBuilder::new(hosts(&["up", "down"]))
        .open_with(connector)
        .await
        .unwrap();
    let again = fleet.connect(false).await.unwrap();
    fleet.run("true", None, false).await;
    fleet.mkdir("/tmp/x").await;

    assert_eq!(ledger.connect_attempts("down"), 1);
    assert_eq!(ledger.connect_attempts("up"), 1);
    assert!(again["down"].err().is_some());
    assert!(fleet.bad_hosts().contains_key("down"));
}

#[tokio::test(start_paused = true)]
async fn timeout_returns_partial_output() {
    let connector = FakeConnector::new("deploy").host(
        "slow",
        HostScript::replying(Reply::Hang {
            partial: "step 1 done\n".into(),
        }),
    );
    let fleet = FleetBuilder::new(hosts(&["slow", "fast"]))
        .open_with(connector)
        .await
        .unwrap();

    let results = fleet
        .run("./long-job.sh", Some(Duration::from_secs(2)), false)
        .await;

    let err = results["slow"].err().unwrap();
    assert!(err.timeout);
    assert_eq!(err.return_code, TIMEOUT_RETURN_CODE);
    assert_eq!(err.stdout, "step 1 done\n");
    assert!(err.error.contains("Command didn't finish in 2 seconds"));
    assert!(results["fast"].ok().unwrap().succeeded);
    assert_eq!(overall_status(&results, false), ExecutionStatus::Failed);
}

#[tokio::test]
async fn secrets_are_masked_in_errors() {
    let connector = FakeConnector::new("deploy")
        .host("h1", HostScript::replying(Reply::Broken("channel closed".into())));
    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .open_with(connector)
        .await
        .unwrap();

    let results = fleet.run("TOKEN=secret123 ./deploy.sh", None, false).await;
    let err = results["h1"].err().unwrap();
    assert!(err.error.contains("TOKEN=******** ./deploy.sh"));
    assert!(!err.error.contains("secret123"));
    assert!(!err.traceback.contains("secret123"));
}

#[tokio::test(start_paused = true)]
async fn secrets_are_masked_in_timeouts() {
    let connector = FakeConnector::new("deploy")
        .host("h1", HostScript::replying(Reply::Hang { partial: String::new() }));
    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .open_with(connector)
        .await
        .unwrap();

    let results = fleet
        .run("DB_PASSWORD=hunter2 psql", Some(Duration::from_secs(1)), false)
        .await;
    let json = serde_json::to_string(&results).unwrap();
    assert!(!json.contains("hunter2"));
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_is_respected() {
    let connector = FakeConnector::new("deploy")
        .host("a", HostScript::default().latency(Duration::from_millis(100)))
        .host("b", HostScript::default().latency(Duration::from_millis(100)));
    let ledger = std::sync::Arc::clone(&connector.ledger);

    let fleet = FleetBuilder::new(hosts(&["a", "b"]))
        .concurrency(1)
        .open_with(connector)
        .await
        .unwrap();
    let results = fleet.run("whoami", None, false).await;

    assert_eq!(results.len(), 2);
    assert!(results.values().all(HostOutcome::succeeded));
    assert_eq!(ledger.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sudo_password_failure_names_the_user() {
    let reply = Reply::Output {
        stdout: String::new(),
        stderr: "[sudo] password for deploy: \nsudo: 3 incorrect password attempts\n".into(),
        code: 1,
    };

    let connector = FakeConnector::new("deploy").host("h1", HostScript::replying(reply.clone()));
    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .sudo_password_detection(true)
        .open_with(connector)
        .await
        .unwrap();
    let results = fleet.run("sudo -S true", None, false).await;
    let err = results["h1"].err().unwrap();
    assert!(err.error.contains("Invalid sudo password provided"));
    assert!(err.error.contains("(deploy)"));

    let connector = FakeConnector::new("deploy").host("h1", HostScript::replying(reply));
    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .open_with(connector)
        .await
        .unwrap();
    let results = fleet.run("sudo -S true", None, false).await;
    assert_eq!(results["h1"].ok().unwrap().return_code, 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let connector = FakeConnector::new("deploy");
    let ledger = std::sync::Arc::clone(&connector.ledger);

    let mut never_connected = FleetBuilder::new(hosts(&["h1"]))
        .connect(false)
        .open_with(connector.clone())
        .await
        .unwrap();
    never_connected.close().await;
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 0);

    let mut fleet = FleetBuilder::new(hosts(&["h1", "h2"]))
        .open_with(connector)
        .await
        .unwrap();
    fleet.close().await;
    fleet.close().await;
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 2);
    assert_eq!(fleet.connected_count(), 0);

    let results = fleet.run("true", None, false).await;
    let err = results["h1"].err().unwrap();
    assert_eq!(err.error, "Skipped host h1. Host is not connected.");
}

#[tokio::test]
async fn put_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("app");
    std::fs::create_dir_all(root.join("conf")).unwrap();
    std::fs::write(root.join("run.sh"), "#!/bin/sh\n").unwrap();
    std::fs::write(root.join("conf/app.toml"), "port = 80\n").unwrap();
    std::fs::write(root.join("conf/extra.toml"), "").unwrap();

    let connector = FakeConnector::new("deploy");
    let fleet = FleetBuilder::new(hosts(&["h1", "h2"]))
        .open_with(connector)
        .await
        .unwrap();
    let results = fleet
        .put(&root, "/srv", PutOptions::with_mode(0o755))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    for outcome in results.values() {
        let files = outcome.ok().unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            ["/srv/app/conf/app.toml", "/srv/app/conf/extra.toml", "/srv/app/run.sh"]
        );
        assert!(files.iter().all(|f| f.mode == 0o755));
        assert_eq!(files[0].size, 10);
    }
}

#[tokio::test]
async fn put_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("motd");
    std::fs::write(&file, "hello\n").unwrap();

    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .open_with(FakeConnector::new("deploy"))
        .await
        .unwrap();
    let results = fleet.put(&file, "/etc/motd", PutOptions::default()).await.unwrap();
    let files = results["h1"].ok().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "/etc/motd");
    assert_eq!(files[0].size, 6);
}

#[tokio::test]
async fn put_missing_local_path_fails_up_front() {
    let connector = FakeConnector::new("deploy");
    let ledger = std::sync::Arc::clone(&connector.ledger);
    let fleet = FleetBuilder::new(hosts(&["h1"]))
        .open_with(connector)
        .await
        .unwrap();

    let err = fleet
        .put(Path::new("/definitely/not/here"), "/tmp", PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::LocalPathMissing { .. }));
    assert!(ledger.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn raise_on_any_error_returns_the_failure() {
    let connector = FakeConnector::new("deploy").host("bad", HostScript::unreachable());
    let err = FleetBuilder::new(hosts(&["bad", "good"]))
        .raise_on_any_error(true)
        .open_with(connector)
        .await
        .unwrap_err();

    let FleetError::HostConnect { host, source } = err else {
        panic!("expected HostConnect");
    };
    assert_eq!(host, "bad");
    assert!(source.is_connection_error());
}

#[tokio::test]
async fn file_and_directory_operations() {
    let fleet = FleetBuilder::new(hosts(&["h1", "h2"]))
        .open_with(FakeConnector::new("deploy"))
        .await
        .unwrap();

    let made = fleet.mkdir("/tmp/work").await;
    assert!(made.values().all(HostOutcome::succeeded));

    let deleted = fleet.delete_file("/tmp/work/missing").await;
    let err = deleted["h1"].err().unwrap();
    assert_eq!(
        err.error,
        "Failed deleting file /tmp/work/missing on host h1. remote path /tmp/work/missing does not exist"
    );

    let removed = fleet.delete_dir("/tmp/work", false, None).await;
    assert_eq!(removed["h2"].ok(), Some(&DirRemoval::Removed));

    let forced = fleet.delete_dir("/tmp/work", true, None).await;
    assert!(matches!(forced["h1"].ok(), Some(DirRemoval::Command(r)) if r.succeeded));
}
