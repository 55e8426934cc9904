use sqlviz_db::{ColumnData, Value};
use sqlviz_worker::{ClientError, Database, MailboxConfig};

fn spawn(chunk_size: usize, scratch: &tempfile::TempDir) -> Database {
    let mut config = MailboxConfig {
        chunk_size,
        ..MailboxConfig::default()
    };
    config.session.scratch_dir = Some(scratch.path().to_path_buf());
    Database::new(config).expect("spawn worker")
}

fn people() -> ColumnData {
    ColumnData::new()
        .with_column("id", [1i64, 2, 3])
        .with_column("name", ["ada", "grace", "edsger"])
}

#[tokio::test]
async fn import_reports_progress_per_chunk_and_refreshes_schema() {
    let scratch = tempfile::tempdir().expect("scratch");
    let mut db = spawn(2, &scratch);
    db.load_db(None, None).await.expect("load");
    assert_eq!(db.name(), Some("database"));
    assert!(db.schema().is_empty());

    let mut seen = Vec::new();
    let summary = db
        .import_table("people", people(), |progress| seen.push(progress))
        .await
        .expect("import");
    assert_eq!(summary.rows, 3);
    assert_eq!(summary.chunks, 2);
    assert_eq!(seen.len(), 2);
    assert!((seen[0] - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(seen[1], 100.0);

    assert_eq!(db.schema().len(), 1);
    assert_eq!(db.schema()[0].table, "people");
    let kinds: Vec<&str> = db.schema()[0].columns.iter().map(|c| c.kind.as_str()).collect();
    assert_eq!(kinds, ["REAL", "TEXT"]);
    assert_eq!(db.client().progress().active(), 0);
    db.shut_down();
}

#[tokio::test]
async fn execute_returns_only_the_last_result() {
    let scratch = tempfile::tempdir().expect("scratch");
    let db = spawn(1500, &scratch);
    let last = db
        .execute("SELECT 1 AS a; SELECT 'two' AS b")
        .await
        .expect("execute")
        .expect("a result");
    assert_eq!(last.columns, ["b"]);
    assert_eq!(last.column("b"), Some(&[Value::Text("two".into())][..]));

    let none = db.execute("CREATE TABLE quiet(x)").await.expect("execute");
    assert!(none.is_none());
    db.shut_down();
}

#[tokio::test]
async fn exported_image_loads_into_a_second_worker() {
    let scratch = tempfile::tempdir().expect("scratch");
    let mut source = spawn(1500, &scratch);
    source.load_db(None, Some("source.sqlite")).await.expect("load");
    source
        .import_table("people", people(), |_| {})
        .await
        .expect("import");
    let image = source.export().await.expect("export");
    source.shut_down();

    let mut copy = spawn(1500, &scratch);
    copy.load_db(Some(image), Some("copy.sqlite")).await.expect("load copy");
    assert_eq!(copy.name(), Some("copy.sqlite"));
    assert_eq!(copy.schema()[0].table, "people");
    let names = copy
        .execute("SELECT name FROM people ORDER BY id DESC")
        .await
        .expect("query")
        .expect("rows");
    assert_eq!(
        names.column("name"),
        Some(&[Value::from("edsger"), Value::from("grace"), Value::from("ada")][..])
    );
    copy.shut_down();
}

#[tokio::test]
async fn worker_errors_surface_with_their_message() {
    let scratch = tempfile::tempdir().expect("scratch");
    let mut db = spawn(1500, &scratch);
    let err = db.execute("SELECT * FROM missing").await.expect_err("no table");
    match err {
        ClientError::Worker(message) => assert!(message.contains("no such table")),
        other => panic!("unexpected error {other:?}"),
    }

    db.import_table("people", people(), |_| {}).await.expect("import");
    let err = db
        .import_table("people", people(), |_| {})
        .await
        .expect_err("duplicate table");
    assert!(err.to_string().contains("already exists"));
    db.refresh_schema().await.expect("refresh");
    assert_eq!(db.schema().len(), 1);
    db.shut_down();
}
