//! Integration tests for maintenance jobs and the command layer

use orgsync::cli::{self, Backend, Command, MigrateJob};
use orgsync::migrations::{ArchiveDescendants, MigrationRunner, RepairDanglingParents};
use orgsync::services::{CascadeChain, RecordingIdentityProvider, Services};
use orgsync::{Config, DocPath, DocumentStore, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn wire(memory: Arc<MemoryStore>, config: Config) -> Arc<Services> {
    Arc::new(
        Services::new(memory, config, Arc::new(RecordingIdentityProvider::new())).unwrap(),
    )
}

async fn get(memory: &MemoryStore, path: &str) -> Value {
    Value::Object(
        memory
            .get(&DocPath::parse(path).unwrap())
            .await
            .unwrap()
            .unwrap()
            .data,
    )
}

fn dangling_snapshot() -> Value {
    json!({
        "districts": {
            "D1": { "name": "Live" },
            "D2": { "name": "Gone", "archived": true }
        },
        "schools": {
            "S1": { "districtId": "D1" },
            "S2": { "districtId": "D2" },
            "S3": { "districtId": "D404" }
        },
        "classes": { "C1": { "schoolId": "S404", "districtId": "D1" } },
        "groups": {
            "G1": { "parentOrgId": "D1", "parentOrgType": "district" },
            "G2": { "parentOrgId": "G404" }
        }
    })
}

#[tokio::test]
async fn test_repair_dangling_parents_job() {
    let memory = Arc::new(MemoryStore::from_snapshot(&dangling_snapshot(), 500).unwrap());
    let services = wire(memory.clone(), Config::default());
    let job = RepairDanglingParents::new(
        services.store.clone(),
        services.config.clone(),
        services.repair.clone(),
    );

    let report = MigrationRunner::new(services.store.clone())
        .with_page_size(2)
        .run(&job)
        .await
        .unwrap();
    assert!(report.completed);
    assert_eq!(report.processed, 8);
    assert_eq!(report.acted, 4);

    assert_eq!(get(&memory, "schools/S1").await["districtId"], json!("D1"));
    assert_eq!(get(&memory, "schools/S2").await["districtId"], Value::Null);
    assert_eq!(get(&memory, "schools/S3").await["districtId"], Value::Null);
    assert_eq!(
        get(&memory, "classes/C1").await,
        json!({ "schoolId": null, "districtId": "D1" })
    );
    assert_eq!(get(&memory, "groups/G1").await["parentOrgId"], json!("D1"));
    assert_eq!(get(&memory, "groups/G2").await["parentOrgId"], Value::Null);
}

#[tokio::test]
async fn test_repair_job_resumes_after_interruption() {
    let memory = Arc::new(MemoryStore::from_snapshot(&dangling_snapshot(), 500).unwrap());
    let services = wire(memory.clone(), Config::default());
    let job = RepairDanglingParents::new(
        services.store.clone(),
        services.config.clone(),
        services.repair.clone(),
    );

    let first = MigrationRunner::new(services.store.clone())
        .with_page_size(2)
        .with_max_pages(2)
        .run(&job)
        .await
        .unwrap();
    assert!(!first.completed);

    let rest = MigrationRunner::new(services.store.clone())
        .with_page_size(2)
        .run(&job)
        .await
        .unwrap();
    assert!(rest.completed);
    assert!(rest.resumed_from.is_some());
    assert_eq!(first.processed + rest.processed, 8);
    assert_eq!(get(&memory, "groups/G2").await["parentOrgId"], Value::Null);
}

#[tokio::test]
async fn test_archive_descendants_finishes_partial_cascades() {
    let memory = Arc::new(
        MemoryStore::from_snapshot(
            &json!({
                "users": {
                    "u1": { "archived": true },
                    "u2": { "archived": false }
                },
                "runs": {
                    "r1": { "parentUserId": "u1", "archived": true },
                    "r2": { "parentUserId": "u2" }
                },
                "trials": {
                    "t1": { "parentRunId": "r1" },
                    "t2": { "parentRunId": "r2" }
                }
            }),
            500,
        )
        .unwrap(),
    );
    let services = wire(memory.clone(), Config::default());
    let chain = CascadeChain::from_config(&services.config, "users").unwrap();
    let job = ArchiveDescendants::new(chain, services.config.archived_field(), services.cascade.clone());

    let report = MigrationRunner::new(services.store.clone()).run(&job).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.acted, 1);
    assert_eq!(get(&memory, "trials/t1").await["archived"], json!(true));
    assert_eq!(get(&memory, "trials/t2").await.get("archived"), None);
    assert_eq!(get(&memory, "runs/r2").await.get("archived"), None);
}

/// Snapshot file in, command, snapshot file out
#[tokio::test]
async fn test_cli_cascade_round_trips_snapshot() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("db.json");
    let output = dir.path().join("out.json");
    std::fs::write(
        &input,
        serde_json::to_string(&json!({
            "guests": { "g1": {} },
            "runs": { "r1": { "parentUserId": "g1" } }
        }))
        .unwrap(),
    )
    .unwrap();

    let args = <cli::Args as clap::Parser>::try_parse_from([
        "orgsync",
        "--snapshot",
        input.to_str().unwrap(),
        "--out",
        output.to_str().unwrap(),
        "cascade",
        "--chain",
        "guests",
        "--root",
        "g1",
    ])
    .unwrap();

    let backend = Backend::open(&args).await.unwrap();
    let services = Arc::new(
        Services::new(
            backend.store(),
            args.load_config().unwrap(),
            Arc::new(RecordingIdentityProvider::new()),
        )
        .unwrap(),
    );
    let result = cli::execute(&args.command, services).await.unwrap();
    assert!(result.success);
    assert_eq!(result.json["rootArchived"], json!(true));

    backend.persist(args.output_path()).await.unwrap();
    let written: Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["guests"]["g1"]["archived"], json!(true));
    assert_eq!(written["runs"]["r1"]["archived"], json!(true));

    // Input untouched when --out is given
    let original: Value = serde_json::from_str(&std::fs::read_to_string(&input).unwrap()).unwrap();
    assert_eq!(original["guests"]["g1"], json!({}));
}

#[tokio::test]
async fn test_cli_replay_and_migrate_commands() {
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("events.jsonl");
    std::fs::write(
        &events,
        [
            r#"{"kind":"updated","path":"schools/S1","before":{"classes":["C1","C2"]},"after":{"classes":["C2"]}}"#,
            "",
            r#"{"kind":"created","path":"userClaims/u1","after":{"claims":{"super_admin":true}}}"#,
        ]
        .join("\n"),
    )
    .unwrap();

    let memory = Arc::new(
        MemoryStore::from_snapshot(
            &json!({
                "classes": { "C1": { "schoolId": "S1" }, "C2": { "schoolId": "S1" } },
                "userClaims": { "u1": { "claims": { "super_admin": true } } }
            }),
            500,
        )
        .unwrap(),
    );
    let services = wire(memory.clone(), Config::default());

    let replay = cli::execute(&Command::Replay { events }, services.clone())
        .await
        .unwrap();
    assert_eq!(replay.json.as_array().unwrap().len(), 2);
    assert_eq!(get(&memory, "classes/C1").await["schoolId"], Value::Null);
    assert_eq!(get(&memory, "classes/C2").await["schoolId"], json!("S1"));

    let migrate = Command::Migrate {
        job: MigrateJob::RepairParents,
        page_size: 10,
        restart: false,
    };
    let first = cli::execute(&migrate, services.clone()).await.unwrap();
    assert_eq!(first.json["completed"], json!(true));
    // C2 still references a school that does not exist
    assert_eq!(get(&memory, "classes/C2").await["schoolId"], Value::Null);

    let again = cli::execute(&migrate, services).await.unwrap();
    assert_eq!(again.json["processed"], json!(0));
}

#[tokio::test]
async fn test_cli_audit_flags_issues() {
    let memory = Arc::new(
        MemoryStore::from_snapshot(&json!({ "schools": { "S1": { "districtId": "D404" } } }), 500)
            .unwrap(),
    );
    let services = wire(memory, Config::default());

    let lenient = cli::execute(&Command::Audit { fail_on_issues: false }, services.clone())
        .await
        .unwrap();
    assert!(lenient.success);
    assert_eq!(lenient.json["danglingParents"].as_array().unwrap().len(), 1);

    let strict = cli::execute(&Command::Audit { fail_on_issues: true }, services)
        .await
        .unwrap();
    assert!(!strict.success);
}
