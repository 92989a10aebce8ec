//! 捕获存储 - 全部协议前端共享的唯一注册表
//!
//! 该服务负责:
//! 1. 捕获记录的注册与去重（`(protocol, key)` 全局唯一）
//! 2. 回放查询与 pending 判定
//! 3. 测试用例与表结构提示的管理
//! 4. 状态文件与回放套件的读写
//!
//! 三张表由同一把读写锁保护，锁内不做任何 I/O；
//! 对外返回的都是快照副本，可安全地在并发任务中迭代。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::Error;
use crate::model::{
    Interaction, InteractionState, Protocol, RequestSnapshot, ResponseSpec, Schema, TestCase,
};

/// 状态文件的顶层结构，三张表均以 id 为键
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    #[serde(default)]
    pub interactions: HashMap<String, Interaction>,
    #[serde(default)]
    pub test_cases: HashMap<String, TestCase>,
    #[serde(default)]
    pub schemas: HashMap<String, Schema>,
}

/// 回放套件文件：单个测试用例及其已配置的捕获记录
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteFile {
    #[serde(default)]
    pub test_case: String,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

#[derive(Default)]
struct Tables {
    // id -> 捕获记录
    interactions: HashMap<String, Interaction>,
    // (protocol, key) -> id，保证同键只注册一次
    index: HashMap<(Protocol, String), String>,
    test_cases: HashMap<String, TestCase>,
    // "{protocol}:{tableName}" -> 表结构提示
    schemas: HashMap<String, Schema>,
}

/// 捕获存储
pub struct Store {
    tables: RwLock<Tables>,
    state_file: PathBuf,
}

fn schema_key(protocol: Protocol, table_name: &str) -> String {
    format!("{}:{}", protocol, table_name)
}

impl Store {
    pub fn new(state_file: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            tables: RwLock::new(Tables::default()),
            state_file: state_file.into(),
        })
    }

    /// 注册一条捕获记录，幂等
    ///
    /// 同一 `(protocol, key)` 的记录最多存在一条：已存在时原样返回，
    /// 不存在时以 pending 状态插入。存在性检查与插入在同一个写锁
    /// 临界区内完成，并发前端对同键的竞争只会产生一条记录。
    pub async fn register(
        &self,
        protocol: Protocol,
        key: String,
        request: RequestSnapshot,
    ) -> Interaction {
        let mut tables = self.tables.write().await;
        if let Some(id) = tables.index.get(&(protocol, key.clone())) {
            if let Some(existing) = tables.interactions.get(id) {
                return existing.clone();
            }
        }
        let interaction = Interaction::pending(protocol, key.clone(), request);
        tables
            .index
            .insert((protocol, key), interaction.id.clone());
        tables
            .interactions
            .insert(interaction.id.clone(), interaction.clone());
        interaction
    }

    /// 查找已配置的记录，pending 状态不参与回放
    pub async fn lookup_configured(&self, protocol: Protocol, key: &str) -> Option<Interaction> {
        let tables = self.tables.read().await;
        let id = tables.index.get(&(protocol, key.to_string()))?;
        tables
            .interactions
            .get(id)
            .filter(|i| i.state == InteractionState::Configured)
            .cloned()
    }

    pub async fn is_pending(&self, protocol: Protocol, key: &str) -> bool {
        let tables = self.tables.read().await;
        tables
            .index
            .get(&(protocol, key.to_string()))
            .and_then(|id| tables.interactions.get(id))
            .map(|i| i.state == InteractionState::Pending)
            .unwrap_or(false)
    }

    /// 为记录配置响应并置为 configured，允许覆盖已有配置
    ///
    /// id、key、capturedAt 保持不变，重复调用效果一致。
    pub async fn configure(
        &self,
        id: &str,
        name: String,
        response: ResponseSpec,
    ) -> Result<Interaction, Error> {
        let mut tables = self.tables.write().await;
        let interaction = tables
            .interactions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("interaction {} not found", id)))?;
        interaction.name = name;
        interaction.response = Some(response);
        interaction.state = InteractionState::Configured;
        Ok(interaction.clone())
    }

    pub async fn list_all(&self) -> Vec<Interaction> {
        let tables = self.tables.read().await;
        tables.interactions.values().cloned().collect()
    }

    pub async fn list_pending(&self) -> Vec<Interaction> {
        let tables = self.tables.read().await;
        tables
            .interactions
            .values()
            .filter(|i| i.state == InteractionState::Pending)
            .cloned()
            .collect()
    }

    // ---- 测试用例 ----

    pub async fn create_test_case(&self, name: String, description: String) -> TestCase {
        let test_case = TestCase {
            id: format!("tc-{}", uuid::Uuid::new_v4()),
            name,
            description,
            interaction_ids: Vec::new(),
            created_at: std::time::SystemTime::now(),
        };
        let mut tables = self.tables.write().await;
        tables
            .test_cases
            .insert(test_case.id.clone(), test_case.clone());
        test_case
    }

    pub async fn list_test_cases(&self) -> Vec<TestCase> {
        let tables = self.tables.read().await;
        tables.test_cases.values().cloned().collect()
    }

    pub async fn get_test_case(&self, id: &str) -> Option<TestCase> {
        let tables = self.tables.read().await;
        tables.test_cases.get(id).cloned()
    }

    /// 更新测试用例，`interaction_ids` 为 Some 时重建捕获记录的反向引用
    pub async fn update_test_case(
        &self,
        id: &str,
        name: String,
        description: String,
        interaction_ids: Option<Vec<String>>,
    ) -> Result<TestCase, Error> {
        let mut tables = self.tables.write().await;
        if !tables.test_cases.contains_key(id) {
            return Err(Error::NotFound(format!("test case {} not found", id)));
        }
        if let Some(ids) = interaction_ids {
            for interaction in tables.interactions.values_mut() {
                if interaction.test_case_id == id {
                    interaction.test_case_id.clear();
                }
            }
            for iid in &ids {
                if let Some(interaction) = tables.interactions.get_mut(iid) {
                    interaction.test_case_id = id.to_string();
                }
            }
            let test_case = tables.test_cases.get_mut(id).unwrap();
            test_case.interaction_ids = ids;
        }
        let test_case = tables.test_cases.get_mut(id).unwrap();
        if !name.is_empty() {
            test_case.name = name;
        }
        test_case.description = description;
        Ok(test_case.clone())
    }

    pub async fn delete_test_case(&self, id: &str) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let test_case = tables
            .test_cases
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("test case {} not found", id)))?;
        for iid in &test_case.interaction_ids {
            if let Some(interaction) = tables.interactions.get_mut(iid) {
                interaction.test_case_id.clear();
            }
        }
        Ok(())
    }

    // ---- 表结构提示 ----

    pub async fn upsert_schema(
        &self,
        protocol: Protocol,
        table_name: String,
        create_statement: String,
    ) {
        let mut tables = self.tables.write().await;
        tables.schemas.insert(
            schema_key(protocol, &table_name),
            Schema {
                table_name,
                protocol,
                create_statement,
            },
        );
    }

    pub async fn get_schema(&self, protocol: Protocol, table_name: &str) -> Option<Schema> {
        let tables = self.tables.read().await;
        tables.schemas.get(&schema_key(protocol, table_name)).cloned()
    }

    pub async fn list_schemas(&self) -> Vec<Schema> {
        let tables = self.tables.read().await;
        tables.schemas.values().cloned().collect()
    }

    // ---- 持久化 ----

    /// 将三张表写入状态文件
    ///
    /// 先在读锁内做快照，释放锁后再写盘；写入走临时文件 + rename，
    /// 避免读到半个文件。
    pub async fn save_state(&self) -> Result<(), Error> {
        let snapshot = {
            let tables = self.tables.read().await;
            StateFile {
                interactions: tables.interactions.clone(),
                test_cases: tables.test_cases.clone(),
                schemas: tables.schemas.clone(),
            }
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.state_file).await?;
        info!("state saved to {}", self.state_file.display());
        Ok(())
    }

    /// 启动时读取状态文件，文件不存在时静默跳过，解析失败时告警后跳过
    pub async fn load_state(&self) {
        let data = match tokio::fs::read(&self.state_file).await {
            Ok(data) => data,
            Err(_) => return,
        };
        let state: StateFile = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                warn!("could not parse {}: {}", self.state_file.display(), e);
                return;
            }
        };
        let mut tables = self.tables.write().await;
        for (id, interaction) in state.interactions {
            tables
                .index
                .insert((interaction.protocol, interaction.key.clone()), id.clone());
            tables.interactions.insert(id, interaction);
        }
        tables.test_cases.extend(state.test_cases);
        tables.schemas.extend(state.schemas);
        info!(
            "state loaded from {}: {} interactions",
            self.state_file.display(),
            tables.interactions.len()
        );
    }

    /// 读取回放套件文件，只装载 state == configured 的记录
    pub async fn load_suite(&self, path: &str) -> Result<usize, Error> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Suite(format!("read suite {}: {}", path, e)))?;
        let suite: SuiteFile = serde_json::from_slice(&data)
            .map_err(|e| Error::Suite(format!("parse suite {}: {}", path, e)))?;
        Ok(self.import_suite(suite).await)
    }

    /// 批量装载套件中的已配置记录，返回装载数量
    pub async fn import_suite(&self, suite: SuiteFile) -> usize {
        let mut tables = self.tables.write().await;
        let mut loaded = 0;
        for interaction in suite.interactions {
            if interaction.state != InteractionState::Configured {
                continue;
            }
            tables.index.insert(
                (interaction.protocol, interaction.key.clone()),
                interaction.id.clone(),
            );
            tables
                .interactions
                .insert(interaction.id.clone(), interaction);
            loaded += 1;
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::db_key;

    fn sql_request(query: &str) -> RequestSnapshot {
        RequestSnapshot::Sql {
            query: query.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = Store::new("test-state.json");
        let key = db_key(Protocol::Postgres, "SELECT 1");
        let first = store
            .register(Protocol::Postgres, key.clone(), sql_request("SELECT 1"))
            .await;
        let second = store
            .register(Protocol::Postgres, key.clone(), sql_request("SELECT 1"))
            .await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.captured_at, second.captured_at);
        assert_eq!(store.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_protocol_is_distinct() {
        let store = Store::new("test-state.json");
        store
            .register(Protocol::Postgres, "K".to_string(), sql_request("K"))
            .await;
        store
            .register(Protocol::Mysql, "K".to_string(), sql_request("K"))
            .await;
        assert_eq!(store.list_all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_configure_flips_state_and_overwrites() {
        let store = Store::new("test-state.json");
        let interaction = store
            .register(
                Protocol::Redis,
                "GET counter".to_string(),
                RequestSnapshot::Redis {
                    command: "GET".to_string(),
                    args: vec!["counter".to_string()],
                },
            )
            .await;
        assert!(store.is_pending(Protocol::Redis, "GET counter").await);

        let configured = store
            .configure(
                &interaction.id,
                "counter".to_string(),
                ResponseSpec::Redis {
                    value: "41".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(configured.state, InteractionState::Configured);
        assert!(!store.is_pending(Protocol::Redis, "GET counter").await);

        // 覆盖配置保留 id 与捕获时间
        let overwritten = store
            .configure(
                &interaction.id,
                "counter".to_string(),
                ResponseSpec::Redis {
                    value: "42".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(overwritten.id, interaction.id);
        assert_eq!(overwritten.captured_at, interaction.captured_at);
        match store
            .lookup_configured(Protocol::Redis, "GET counter")
            .await
            .unwrap()
            .response
            .unwrap()
        {
            ResponseSpec::Redis { value } => assert_eq!(value, "42"),
            other => panic!("unexpected response variant: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_configure_unknown_id_is_not_found() {
        let store = Store::new("test-state.json");
        let err = store
            .configure(
                "missing",
                String::new(),
                ResponseSpec::Redis {
                    value: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_lookup_ignores_pending() {
        let store = Store::new("test-state.json");
        let key = db_key(Protocol::Mysql, "SELECT * FROM t");
        store
            .register(Protocol::Mysql, key.clone(), sql_request("SELECT * FROM t"))
            .await;
        assert!(store.lookup_configured(Protocol::Mysql, &key).await.is_none());
        assert_eq!(store.list_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_register_single_record() {
        let store = Store::new("test-state.json");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .register(
                        Protocol::Http,
                        "GET api.example.com / ".to_string(),
                        RequestSnapshot::Http {
                            method: "GET".to_string(),
                            host: "api.example.com".to_string(),
                            path: "/".to_string(),
                            headers: Default::default(),
                            body: String::new(),
                            body_hash: String::new(),
                        },
                    )
                    .await
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_suite_load_filters_configured() {
        let dir = tempfile::tempdir().unwrap();
        let suite_path = dir.path().join("suite.json");

        let configured = {
            let mut i = Interaction::pending(
                Protocol::Redis,
                "GET a".to_string(),
                RequestSnapshot::Redis {
                    command: "GET".to_string(),
                    args: vec!["a".to_string()],
                },
            );
            i.response = Some(ResponseSpec::Redis {
                value: "1".to_string(),
            });
            i.state = InteractionState::Configured;
            i
        };
        let pending = Interaction::pending(
            Protocol::Redis,
            "GET b".to_string(),
            RequestSnapshot::Redis {
                command: "GET".to_string(),
                args: vec!["b".to_string()],
            },
        );
        let suite = SuiteFile {
            test_case: "case-1".to_string(),
            interactions: vec![configured, pending],
        };
        std::fs::write(&suite_path, serde_json::to_vec(&suite).unwrap()).unwrap();

        let store = Store::new(dir.path().join("state.json"));
        let loaded = store.load_suite(suite_path.to_str().unwrap()).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(store.lookup_configured(Protocol::Redis, "GET a").await.is_some());
        assert!(!store.is_pending(Protocol::Redis, "GET b").await);
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = Store::new(&path);
        let interaction = store
            .register(Protocol::Postgres, db_key(Protocol::Postgres, "SELECT 1"), sql_request("SELECT 1"))
            .await;
        store
            .configure(
                &interaction.id,
                "one".to_string(),
                ResponseSpec::Sql {
                    rows: Vec::new(),
                    affected_rows: 0,
                },
            )
            .await
            .unwrap();
        store.upsert_schema(Protocol::Mysql, "users".to_string(), "CREATE TABLE users (id INT)".to_string()).await;
        store.save_state().await.unwrap();

        let restored = Store::new(&path);
        restored.load_state().await;
        let found = restored
            .lookup_configured(Protocol::Postgres, "POSTGRES SELECT 1")
            .await
            .unwrap();
        assert_eq!(found.id, interaction.id);
        assert_eq!(found.name, "one");
        assert!(restored.get_schema(Protocol::Mysql, "users").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_test_case_clears_back_references() {
        let store = Store::new("test-state.json");
        let interaction = store
            .register(Protocol::Redis, "GET x".to_string(), sql_request("unused"))
            .await;
        let test_case = store
            .create_test_case("case".to_string(), "desc".to_string())
            .await;
        store
            .update_test_case(
                &test_case.id,
                String::new(),
                "desc".to_string(),
                Some(vec![interaction.id.clone()]),
            )
            .await
            .unwrap();
        let all = store.list_all().await;
        assert_eq!(all[0].test_case_id, test_case.id);

        store.delete_test_case(&test_case.id).await.unwrap();
        let all = store.list_all().await;
        assert!(all[0].test_case_id.is_empty());
        assert!(store.get_test_case(&test_case.id).await.is_none());
    }
}
