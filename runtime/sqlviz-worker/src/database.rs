//! UI-facing database wrapper over a [`WorkerClient`].

use crate::client::{ClientError, WorkerClient};
use crate::mailbox::MailboxConfig;
use regex::Regex;
use sqlviz_db::{ColumnData, ExecResult, ImportSummary, TableSchema};
use std::sync::LazyLock;
use tracing::info;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("non-word regex"));
static LEADING_DIGIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9])").expect("leading digit regex"));
static REPEATED_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("underscore regex"));

const DEFAULT_NAME: &str = "database";

pub struct Database {
    client: WorkerClient,
    name: Option<String>,
    schema: Vec<TableSchema>,
}

impl Database {
    pub fn new(config: MailboxConfig) -> Result<Self, ClientError> {
        Ok(Self {
            client: WorkerClient::spawn(config)?,
            name: None,
            schema: Vec::new(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Tables and columns as of the last refresh.
    pub fn schema(&self) -> &[TableSchema] {
        &self.schema
    }

    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    /// Opens `image` (or a new empty database) and refreshes the schema.
    pub async fn load_db(
        &mut self,
        image: Option<Vec<u8>>,
        name: Option<&str>,
    ) -> Result<(), ClientError> {
        let bytes = image.as_ref().map_or(0, Vec::len);
        self.client.open(image).await?;
        self.name = Some(name.unwrap_or(DEFAULT_NAME).to_string());
        info!(name = self.name.as_deref(), bytes, "database loaded");
        self.refresh_schema().await?;
        Ok(())
    }

    /// Imports `data` as `table`, calling `on_progress` with each percentage.
    pub async fn import_table(
        &mut self,
        table: &str,
        data: ColumnData,
        mut on_progress: impl FnMut(f64),
    ) -> Result<ImportSummary, ClientError> {
        let mut stream = self.client.progress().create();
        let counter = stream.id();
        let result = {
            let call = self.client.import(table, data, Some(counter), None);
            tokio::pin!(call);
            loop {
                tokio::select! {
                    biased;
                    Some(progress) = stream.next() => on_progress(progress),
                    result = &mut call => break result,
                }
            }
        };
        while let Some(progress) = stream.try_next() {
            on_progress(progress);
        }
        self.client.progress().delete(counter);
        let summary = result?;
        self.name.get_or_insert_with(|| DEFAULT_NAME.to_string());
        self.refresh_schema().await?;
        Ok(summary)
    }

    /// Runs `sql` on a fresh handle and returns the last row-producing result.
    pub async fn execute(&self, sql: &str) -> Result<Option<ExecResult>, ClientError> {
        self.client.reopen().await?;
        let mut results = self.client.exec(sql, None).await?;
        Ok(results.pop())
    }

    pub async fn refresh_schema(&mut self) -> Result<&[TableSchema], ClientError> {
        self.schema = self.client.schema().await?;
        Ok(&self.schema)
    }

    pub async fn export(&self) -> Result<Vec<u8>, ClientError> {
        self.client.export().await
    }

    /// Checks that `name` can be used for a new table.
    pub async fn validate_table_name(&self, name: &str) -> Result<(), ClientError> {
        if name.starts_with("sqlite_") {
            return Err(ClientError::InvalidTableName(
                "Table name can't start with sqlite_".to_string(),
            ));
        }
        if NON_WORD.is_match(name) {
            return Err(ClientError::InvalidTableName(
                "Table name can contain only letters, digits and underscores".to_string(),
            ));
        }
        if LEADING_DIGIT.is_match(name) {
            return Err(ClientError::InvalidTableName(
                "Table name can't start with a digit".to_string(),
            ));
        }
        self.execute(&format!("BEGIN; CREATE TABLE \"{name}\"(id); ROLLBACK;"))
            .await?;
        Ok(())
    }

    /// Turns an arbitrary label into a usable table name.
    pub fn sanitize_table_name(name: &str) -> String {
        let name = NON_WORD.replace_all(name, "_");
        let name = LEADING_DIGIT.replace(&name, "_$1");
        REPEATED_UNDERSCORE.replace_all(&name, "_").into_owned()
    }

    pub fn shut_down(self) {
        self.client.terminate();
    }
}
