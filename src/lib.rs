//! kovi-plugin-elysian-realm
//!
//! 崩坏3往世乐土攻略插件
//!
//! 指令: 乐土<昵称> 查询攻略图 | 乐土更新 同步图库 | 乐土昵称 维护角色昵称 | 乐土状态 查看资源状态
//!
//! 攻略图通过 git 镜像远端仓库获取，启动及定时巡检时核对昵称索引，
//! 缺少昵称的角色会私聊提醒管理员。

// --- 错误类型 ---
mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ResourceError {
        #[error("路径 {0:?} 不存在")]
        NotFound(PathBuf),

        #[error("文件 {path:?} 解码错误: {source}")]
        Decode {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },

        #[error("序列化失败: {0}")]
        Serialization(#[source] serde_json::Error),

        #[error("目录 {0:?} 不为空")]
        DirectoryNotEmpty(PathBuf),

        #[error("目标目录已存在克隆数据: {0}")]
        AlreadyExists(String),

        #[error("克隆异常: {0}")]
        CloneFailed(String),

        #[error("拉取异常: {0}")]
        PullFailed(String),

        #[error("操作已取消")]
        Cancelled,

        #[error("IO 错误: {0}")]
        Io(#[from] std::io::Error),
    }
}

// --- 配置 ---
mod config {
    use kovi::utils::load_json_data;
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Config {
        /// 攻略图远端仓库
        #[serde(default = "default_repository")]
        pub image_repository: String,
        /// 资源巡检间隔 (秒)
        #[serde(default = "default_interval")]
        pub refresh_interval: u64,
        /// 单次 git 操作时限 (秒)
        #[serde(default = "default_git_timeout")]
        pub git_timeout: u64,
        /// 访问远端仓库使用的代理
        #[serde(default)]
        pub proxy: Option<String>,
        /// 接收运维提醒的管理员 QQ
        #[serde(default)]
        pub superusers: Vec<i64>,
    }

    fn default_repository() -> String {
        "https://github.com/MskTmi/ElysianRealm-Data".to_string()
    }

    fn default_interval() -> u64 {
        3600
    }

    fn default_git_timeout() -> u64 {
        300
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                image_repository: default_repository(),
                refresh_interval: default_interval(),
                git_timeout: default_git_timeout(),
                proxy: None,
                superusers: Vec::new(),
            }
        }
    }

    impl Config {
        pub fn load(data_dir: &Path) -> Self {
            let path = data_dir.join("config.json");
            let default = Self::default();
            load_json_data(default.clone(), path).unwrap_or(default)
        }
    }
}

// --- 昵称表 ---
mod nickname {
    use super::error::ResourceError;
    use indexmap::IndexMap;
    use std::fs;
    use std::path::Path;

    /// 规范名 -> 昵称列表，保持文件中的键序
    pub type NicknameTable = IndexMap<String, Vec<String>>;

    pub fn load(path: &Path) -> Result<NicknameTable, ResourceError> {
        if !path.exists() {
            return Err(ResourceError::NotFound(path.to_path_buf()));
        }
        if fs::metadata(path)?.len() == 0 {
            kovi::log::warn!("文件 {} 为空", path.display());
            return Ok(NicknameTable::new());
        }
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ResourceError::Decode {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// 先写临时文件再原子替换，中途失败不破坏原有数据
    pub fn save(path: &Path, table: &NicknameTable) -> Result<(), ResourceError> {
        let parent_ok = path
            .parent()
            .map(|p| p.as_os_str().is_empty() || p.is_dir())
            .unwrap_or(false);
        if !parent_ok || path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(ResourceError::NotFound(path.to_path_buf()));
        }

        let text = serde_json::to_string_pretty(table).map_err(ResourceError::Serialization)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// 逐键覆盖合并：incoming 中的键整组替换 base 中的同名键
    pub fn merge(mut base: NicknameTable, incoming: NicknameTable) -> NicknameTable {
        for (key, aliases) in incoming {
            base.insert(key, aliases);
        }
        base
    }

    /// 按昵称反查规范名，命中多个键时取键序靠前者
    pub fn resolve<'a>(table: &'a NicknameTable, query: &str) -> Option<&'a str> {
        table
            .iter()
            .find(|(_, aliases)| aliases.iter().any(|a| a == query))
            .map(|(key, _)| key.as_str())
    }

}

// --- 图库扫描 ---
mod assets {
    use super::error::ResourceError;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};

    /// 列出图库目录下所有 jpg 文件的主名，不递归
    pub fn list(dir: &Path) -> Result<BTreeSet<String>, ResourceError> {
        if !dir.is_dir() {
            return Err(ResourceError::NotFound(dir.to_path_buf()));
        }
        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some("jpg")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.insert(stem.to_string());
            }
        }
        Ok(ids)
    }

    pub fn image_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{key}.jpg"))
    }

}

// --- 仓库镜像 ---
mod mirror {
    use super::error::ResourceError;
    use regex::Regex;
    use std::path::Path;
    use std::process::{ExitStatus, Stdio};
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::{Child, Command};
    use tokio::time;

    static RE_RATE: OnceLock<Regex> = OnceLock::new();

    /// 传输进度观察者，只接收速率信息
    pub trait ProgressSink: Send + Sync {
        fn rate(&self, rate: &str);
    }

    /// 默认实现：进度写入日志
    pub struct LogSink;

    impl ProgressSink for LogSink {
        fn rate(&self, rate: &str) {
            kovi::log::info!("下载速度: {rate}");
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PullOutcome {
        UpToDate,
        Updated,
    }

    /// 从 git 进度行中提取传输速率
    fn parse_rate(line: &str) -> Option<&str> {
        let re = RE_RATE.get_or_init(|| Regex::new(r"\|\s*([\d.]+\s*[\w/]+/s)").unwrap());
        re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
    }

    /// 边读边转发子进程输出，返回退出状态与完整的 stdout/stderr 文本
    async fn drain(
        child: &mut Child,
        sink: &dyn ProgressSink,
    ) -> std::io::Result<(ExitStatus, String, String)> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_out = async {
            let mut buf = String::new();
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Some(line) = lines.next_line().await? {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            Ok::<_, std::io::Error>(buf)
        };

        // git 的进度信息在 stderr 中
        let read_err = async {
            let mut buf = String::new();
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Some(line) = lines.next_line().await? {
                    match parse_rate(&line) {
                        Some(rate) => sink.rate(rate),
                        None => kovi::log::debug!("git: {line}"),
                    }
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (out, err) = tokio::try_join!(read_out, read_err)?;
        let status = child.wait().await?;
        Ok((status, out, err))
    }

    /// 目录是否已是指定远端的镜像。任何失败都返回 false，不抛错
    pub async fn check_origin(path: &Path, expected_url: &str) -> bool {
        if !path.is_dir() {
            return false;
        }
        let output = Command::new("git")
            .args(["config", "--get", "remote.origin.url"])
            .current_dir(path)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let remote = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if remote == expected_url {
                    kovi::log::debug!("目录下仓库地址与配置一致");
                    true
                } else {
                    kovi::log::debug!("目录下仓库地址: {remote}");
                    kovi::log::debug!("配置仓库地址: {expected_url}");
                    false
                }
            }
            _ => false,
        }
    }

    /// 浅克隆远端仓库到 target。target 必须不存在、为空目录或仅含 .gitkeep 占位
    pub async fn clone(
        url: &str,
        target: &Path,
        limit: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<(), ResourceError> {
        if target.exists() {
            let entries: Vec<std::fs::DirEntry> =
                std::fs::read_dir(target)?.collect::<Result<_, _>>()?;
            let only_marker = entries.iter().all(|e| e.file_name() == ".gitkeep");
            if !entries.is_empty() {
                if !only_marker {
                    return Err(ResourceError::DirectoryNotEmpty(target.to_path_buf()));
                }
                std::fs::remove_file(target.join(".gitkeep"))?;
            }
        }

        let mut child = Command::new("git")
            .args(["clone", "--progress", "--depth=1", url])
            .arg(target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ResourceError::CloneFailed(e.to_string()))?;

        match time::timeout(limit, drain(&mut child, sink)).await {
            Err(_) => {
                let _ = child.kill().await;
                Err(ResourceError::Cancelled)
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(ResourceError::CloneFailed(e.to_string()))
            }
            Ok(Ok((status, _, stderr))) => {
                if status.success() {
                    Ok(())
                } else if stderr.contains("fatal: destination path") {
                    // 目标已被其他克隆抢先占用，属于竞态而非故障
                    Err(ResourceError::AlreadyExists(stderr.trim().to_string()))
                } else {
                    Err(ResourceError::CloneFailed(stderr.trim().to_string()))
                }
            }
        }
    }

    /// 拉取镜像目录的更新
    pub async fn pull(
        target: &Path,
        limit: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<PullOutcome, ResourceError> {
        if !target.is_dir() {
            return Err(ResourceError::NotFound(target.to_path_buf()));
        }

        let mut child = Command::new("git")
            .args(["pull", "--progress"])
            .current_dir(target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ResourceError::PullFailed(e.to_string()))?;

        match time::timeout(limit, drain(&mut child, sink)).await {
            Err(_) => {
                let _ = child.kill().await;
                Err(ResourceError::Cancelled)
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(ResourceError::PullFailed(e.to_string()))
            }
            Ok(Ok((status, stdout, stderr))) => {
                if !status.success() {
                    return Err(ResourceError::PullFailed(stderr.trim().to_string()));
                }
                if stdout.contains("Already up to date.") {
                    Ok(PullOutcome::UpToDate)
                } else {
                    Ok(PullOutcome::Updated)
                }
            }
        }
    }

    /// 同步前的连通性探测，失败只代表本轮跳过
    pub async fn check_url(url: &str, proxy: Option<&str>) -> bool {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(p) = proxy {
            match reqwest::Proxy::all(p) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    kovi::log::error!("代理配置无效: {e}");
                    return false;
                }
            }
        }
        let Ok(client) = builder.build() else {
            return false;
        };
        match client.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                kovi::log::debug!("仓库连通性检查失败: {e}");
                false
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::Mutex;
        use tempfile::tempdir;

        struct NullSink;

        impl ProgressSink for NullSink {
            fn rate(&self, _rate: &str) {}
        }

        struct CollectSink(Mutex<Vec<String>>);

        impl ProgressSink for CollectSink {
            fn rate(&self, rate: &str) {
                self.0.lock().unwrap().push(rate.to_string());
            }
        }

        fn git_available() -> bool {
            std::process::Command::new("git")
                .arg("--version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        fn git(dir: &Path, args: &[&str]) {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git 不可用");
            assert!(
                out.status.success(),
                "git {args:?}: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }

        /// 建一个带单次提交的本地仓库作为克隆源
        fn init_source(dir: &Path) {
            git(dir, &["init", "-q"]);
            std::fs::write(dir.join("Human.jpg"), b"jpg").unwrap();
            git(dir, &["add", "."]);
            git(
                dir,
                &[
                    "-c",
                    "user.name=ci",
                    "-c",
                    "user.email=ci@example.com",
                    "commit",
                    "-q",
                    "-m",
                    "init",
                ],
            );
        }

        #[test]
        fn parses_transfer_rate_from_progress_line() {
            let line = "Receiving objects:  45% (450/1000), 2.50 MiB | 3.20 MiB/s";
            assert_eq!(parse_rate(line), Some("3.20 MiB/s"));
            assert_eq!(parse_rate("Cloning into 'images'..."), None);
            assert_eq!(parse_rate(""), None);
        }

        #[tokio::test]
        async fn clone_refuses_foreign_directory() {
            let dir = tempdir().unwrap();
            let target = dir.path().join("mirror");
            std::fs::create_dir(&target).unwrap();
            std::fs::write(target.join("unrelated.txt"), "keep me").unwrap();

            let err = clone(
                "https://example.com/repo.git",
                &target,
                Duration::from_secs(5),
                &NullSink,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ResourceError::DirectoryNotEmpty(_)));
            // 目录内容保持原样
            assert_eq!(
                std::fs::read_to_string(target.join("unrelated.txt")).unwrap(),
                "keep me"
            );
            assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
        }

        #[tokio::test]
        async fn pull_missing_directory_is_not_found() {
            let dir = tempdir().unwrap();
            let err = pull(
                &dir.path().join("missing"),
                Duration::from_secs(5),
                &NullSink,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ResourceError::NotFound(_)));
        }

        #[tokio::test]
        async fn check_origin_never_raises() {
            if !git_available() {
                return;
            }
            let dir = tempdir().unwrap();
            // 普通目录与缺失目录都只返回 false
            assert!(!check_origin(dir.path(), "https://example.com/repo.git").await);
            assert!(
                !check_origin(&dir.path().join("missing"), "https://example.com/repo.git").await
            );
        }

        #[tokio::test]
        async fn clone_pull_and_check_origin_against_local_source() {
            if !git_available() {
                return;
            }
            let dir = tempdir().unwrap();
            let src = dir.path().join("source");
            std::fs::create_dir(&src).unwrap();
            init_source(&src);
            let url = src.to_str().unwrap().to_string();

            // 仅含占位文件的目录不阻止克隆
            let target = dir.path().join("mirror");
            std::fs::create_dir(&target).unwrap();
            std::fs::write(target.join(".gitkeep"), "").unwrap();

            let sink = CollectSink(Mutex::new(Vec::new()));
            clone(&url, &target, Duration::from_secs(60), &sink)
                .await
                .unwrap();
            assert!(target.join("Human.jpg").is_file());

            assert!(check_origin(&target, &url).await);
            assert!(!check_origin(&target, "https://example.com/other.git").await);

            let outcome = pull(&target, Duration::from_secs(60), &NullSink)
                .await
                .unwrap();
            assert_eq!(outcome, PullOutcome::UpToDate);
        }

        #[tokio::test]
        async fn pull_with_zero_timeout_is_cancelled() {
            if !git_available() {
                return;
            }
            let dir = tempdir().unwrap();
            let src = dir.path().join("source");
            std::fs::create_dir(&src).unwrap();
            init_source(&src);
            let target = dir.path().join("mirror");
            clone(
                src.to_str().unwrap(),
                &target,
                Duration::from_secs(60),
                &NullSink,
            )
            .await
            .unwrap();

            let err = pull(&target, Duration::ZERO, &NullSink).await.unwrap_err();
            assert!(matches!(err, ResourceError::Cancelled));
        }
    }
}

// --- 资源核对 ---
mod reconcile {
    use super::nickname::NicknameTable;
    use std::collections::BTreeSet;

    /// 图库与昵称表之间的差异
    #[derive(Debug, Default)]
    pub struct DriftReport {
        /// 图库中存在、昵称表缺失的角色
        pub missing: Vec<String>,
        /// 昵称列表为空的角色 (含本轮新增)
        pub empty_value_keys: Vec<String>,
    }

    /// 对齐昵称表与图库：只补缺失键，绝不改动已有键的昵称。
    /// missing 为空时表内容未变，调用方不需要落盘
    pub fn reconcile(
        mut table: NicknameTable,
        asset_ids: &BTreeSet<String>,
    ) -> (NicknameTable, DriftReport) {
        let missing: Vec<String> = asset_ids
            .iter()
            .filter(|id| !table.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in &missing {
            table.insert(id.clone(), Vec::new());
        }
        let empty_value_keys = table
            .iter()
            .filter(|(_, aliases)| aliases.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        (
            table,
            DriftReport {
                missing,
                empty_value_keys,
            },
        )
    }

}

// --- 业务逻辑 ---
mod logic {
    use super::assets;
    use super::config::Config;
    use super::error::ResourceError;
    use super::mirror::{self, LogSink, PullOutcome};
    use super::nickname::{self, NicknameTable};
    use super::reconcile;
    use anyhow::Context;
    use chrono::{DateTime, Local};
    use kovi::bot::message::Message;
    use kovi::{MsgEvent, RuntimeBot};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    const HELP: &str = "往世乐土攻略\n\
乐土<昵称>  查询角色攻略图\n\
乐土更新  同步攻略图库 (管理员)\n\
乐土昵称 <角色> <昵称1,昵称2>  设置角色昵称，整组覆盖 (管理员)\n\
乐土状态  查看资源状态";

    /// 单轮镜像同步的结果
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MirrorOutcome {
        Cloned,
        Updated,
        UpToDate,
        Skipped,
        Failed,
    }

    #[derive(Debug)]
    pub struct RefreshReport {
        pub mirror: MirrorOutcome,
        pub added: Vec<String>,
        pub empty_value_keys: Vec<String>,
        pub finished_at: DateTime<Local>,
    }

    pub struct Orchestrator {
        cfg: Config,
        image_path: PathBuf,
        nickname_path: PathBuf,
        // 同一镜像目录同一时刻只允许一轮同步
        guard: kovi::tokio::sync::Mutex<()>,
        last_refresh: std::sync::RwLock<Option<DateTime<Local>>>,
    }

    impl Orchestrator {
        pub fn new(cfg: Config, data_dir: PathBuf) -> Self {
            if !data_dir.exists() {
                std::fs::create_dir_all(&data_dir).expect("Failed to create data directory");
            }
            let image_path = data_dir.join("images");
            let nickname_path = data_dir.join("nickname.json");
            Self {
                cfg,
                image_path,
                nickname_path,
                guard: kovi::tokio::sync::Mutex::new(()),
                last_refresh: std::sync::RwLock::new(None),
            }
        }

        pub fn refresh_interval(&self) -> u64 {
            self.cfg.refresh_interval.max(60)
        }

        pub fn is_superuser(&self, user_id: i64) -> bool {
            self.cfg.superusers.contains(&user_id)
        }

        pub fn superusers(&self) -> &[i64] {
            &self.cfg.superusers
        }

        pub fn last_refresh(&self) -> Option<DateTime<Local>> {
            *self.last_refresh.read().unwrap()
        }

        /// 一轮完整的资源检查：同步镜像、扫描图库、核对昵称表
        pub async fn refresh(&self) -> anyhow::Result<RefreshReport> {
            let _guard = self.guard.lock().await;

            let mirror = self.sync_mirror().await;

            let asset_ids = assets::list(&self.image_path)
                .with_context(|| format!("图片目录 {} 不可用", self.image_path.display()))?;

            let table = match nickname::load(&self.nickname_path) {
                Ok(table) => table,
                Err(ResourceError::NotFound(_)) => {
                    kovi::log::warn!("{} 不存在，将重新生成", self.nickname_path.display());
                    NicknameTable::new()
                }
                Err(e) => return Err(e).context("昵称表加载失败"),
            };

            let (table, drift) = reconcile::reconcile(table, &asset_ids);
            if drift.missing.is_empty() {
                kovi::log::info!("nickname.json 已是最新版本");
            } else {
                kovi::log::warn!("nickname.json 缺少以下角色: {:?}", drift.missing);
                nickname::save(&self.nickname_path, &table).context("昵称表保存失败")?;
            }

            let finished_at = Local::now();
            *self.last_refresh.write().unwrap() = Some(finished_at);
            Ok(RefreshReport {
                mirror,
                added: drift.missing,
                empty_value_keys: drift.empty_value_keys,
                finished_at,
            })
        }

        /// 镜像同步失败只降级不中断，仍用磁盘上的现有资源应答
        async fn sync_mirror(&self) -> MirrorOutcome {
            let repo = &self.cfg.image_repository;
            if !mirror::check_url(repo, self.cfg.proxy.as_deref()).await {
                kovi::log::warn!("仓库 {repo} 当前不可达，跳过本次同步");
                return MirrorOutcome::Skipped;
            }

            let limit = Duration::from_secs(self.cfg.git_timeout);
            if mirror::check_origin(&self.image_path, repo).await {
                match mirror::pull(&self.image_path, limit, &LogSink).await {
                    Ok(PullOutcome::UpToDate) => {
                        kovi::log::info!("图片资源已是最新版本");
                        MirrorOutcome::UpToDate
                    }
                    Ok(PullOutcome::Updated) => {
                        kovi::log::info!("图片资源更新完成");
                        MirrorOutcome::Updated
                    }
                    Err(ResourceError::Cancelled) => {
                        kovi::log::error!("图片资源更新超时，子进程已终止");
                        MirrorOutcome::Failed
                    }
                    Err(e) => {
                        kovi::log::error!("图片资源更新异常: {e}");
                        MirrorOutcome::Failed
                    }
                }
            } else {
                match mirror::clone(repo, &self.image_path, limit, &LogSink).await {
                    Ok(()) => {
                        kovi::log::info!("乐土攻略获取完成");
                        MirrorOutcome::Cloned
                    }
                    Err(ResourceError::AlreadyExists(detail)) => {
                        kovi::log::warn!("目标目录已存在克隆数据: {detail}");
                        MirrorOutcome::Skipped
                    }
                    Err(ResourceError::DirectoryNotEmpty(path)) => {
                        kovi::log::error!(
                            "目录 {} 不为空且不是图库镜像，请人工处理",
                            path.display()
                        );
                        MirrorOutcome::Failed
                    }
                    Err(e) => {
                        kovi::log::error!("克隆异常: {e}");
                        MirrorOutcome::Failed
                    }
                }
            }
        }

        /// 按昵称查攻略图。查不到是正常结果 Ok(None)，表损坏才是 Err
        pub fn resolve_image(&self, query: &str) -> Result<Option<PathBuf>, ResourceError> {
            let table = match nickname::load(&self.nickname_path) {
                Ok(table) => table,
                Err(ResourceError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let Some(key) = nickname::resolve(&table, query) else {
                return Ok(None);
            };
            let path = assets::image_path(&self.image_path, key);
            if path.is_file() {
                Ok(Some(path))
            } else {
                kovi::log::warn!("角色 {key} 的攻略图缺失: {}", path.display());
                Ok(None)
            }
        }

        /// 整组覆盖某个角色的昵称并落盘
        pub async fn set_aliases(
            &self,
            key: &str,
            aliases: Vec<String>,
        ) -> Result<(), ResourceError> {
            let _guard = self.guard.lock().await;
            let base = match nickname::load(&self.nickname_path) {
                Ok(table) => table,
                Err(ResourceError::NotFound(_)) => NicknameTable::new(),
                Err(e) => return Err(e),
            };
            if !assets::image_path(&self.image_path, key).is_file() {
                kovi::log::warn!("角色 {key} 暂无对应攻略图");
            }
            let incoming = NicknameTable::from_iter([(key.to_string(), aliases)]);
            let merged = nickname::merge(base, incoming);
            nickname::save(&self.nickname_path, &merged)
        }

        pub fn table_stats(&self) -> (usize, usize) {
            match nickname::load(&self.nickname_path) {
                Ok(table) => {
                    let empty = table.values().filter(|v| v.is_empty()).count();
                    (table.len(), empty)
                }
                Err(_) => (0, 0),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Cmd {
        Query(String),
        Update,
        Status,
        Help,
        SetAlias { key: String, aliases: Vec<String> },
    }

    /// 指令以「乐土」开头，允许带 "/" 前缀
    pub fn parse_command(raw: &str) -> Option<Cmd> {
        let text = raw.trim();
        let text = text.strip_prefix('/').unwrap_or(text);
        let rest = text.strip_prefix("乐土")?.trim();

        if rest.is_empty() || rest == "帮助" {
            return Some(Cmd::Help);
        }
        if rest == "更新" {
            return Some(Cmd::Update);
        }
        if rest == "状态" {
            return Some(Cmd::Status);
        }
        if let Some(args) = rest.strip_prefix("昵称") {
            let mut parts = args.trim().splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or("").to_string();
            if key.is_empty() {
                return Some(Cmd::Help);
            }
            let aliases = split_aliases(parts.next().unwrap_or(""));
            return Some(Cmd::SetAlias { key, aliases });
        }
        Some(Cmd::Query(rest.to_string()))
    }

    /// 拆分 [,，] 分隔的昵称串
    pub fn split_aliases(input: &str) -> Vec<String> {
        input
            .replace('，', ",")
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub(crate) fn reply_text(event: &Arc<MsgEvent>, text: impl Into<String>) {
        event.reply(
            Message::new()
                .add_reply(event.message_id)
                .add_text(text.into()),
        );
    }

    pub async fn execute(
        cmd: Cmd,
        event: &Arc<MsgEvent>,
        orch: &Arc<Orchestrator>,
        bot: &Arc<RuntimeBot>,
    ) {
        match cmd {
            Cmd::Query(query) => match orch.resolve_image(&query) {
                Ok(Some(path)) => {
                    event.reply(
                        Message::new()
                            .add_reply(event.message_id)
                            .add_image(&format!("file://{}", path.display())),
                    );
                }
                Ok(None) => reply_text(event, format!("未找到指定角色: {query}")),
                Err(e) => {
                    kovi::log::error!("昵称查询异常: {e}");
                    reply_text(event, "攻略查询暂不可用，请稍后再试");
                }
            },

            Cmd::Update => {
                if !orch.is_superuser(event.user_id) {
                    reply_text(event, "权限不足");
                    return;
                }
                match orch.refresh().await {
                    Ok(report) => {
                        reply_text(event, "更新成功");
                        notify_drift(&report, orch, bot);
                    }
                    Err(e) => {
                        kovi::log::error!("手动更新失败: {e:#}");
                        reply_text(event, "更新失败");
                    }
                }
            }

            Cmd::Status => {
                let (total, empty) = orch.table_stats();
                let last = orch
                    .last_refresh()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "从未".to_string());
                reply_text(
                    event,
                    format!("图库角色: {total}\n缺少昵称: {empty}\n上次同步: {last}"),
                );
            }

            Cmd::Help => reply_text(event, HELP),

            Cmd::SetAlias { key, aliases } => {
                if !orch.is_superuser(event.user_id) {
                    reply_text(event, "权限不足");
                    return;
                }
                let count = aliases.len();
                match orch.set_aliases(&key, aliases).await {
                    Ok(()) => reply_text(event, format!("已更新 {key} 的昵称 ({count} 条)")),
                    Err(e) => {
                        kovi::log::error!("昵称更新失败: {e}");
                        reply_text(event, "昵称更新失败");
                    }
                }
            }
        }
    }

    /// 启动及定时触发的巡检
    pub async fn run_cycle(orch: &Arc<Orchestrator>, bot: &Arc<RuntimeBot>) {
        kovi::log::debug!("开始检查图片资源");
        match orch.refresh().await {
            Ok(report) => {
                kovi::log::info!(
                    "本轮同步 {:?}，新增 {} 个角色",
                    report.mirror,
                    report.added.len()
                );
                notify_drift(&report, orch, bot);
            }
            Err(e) => kovi::log::error!("资源巡检失败: {e:#}"),
        }
    }

    /// 空昵称角色通过私聊提醒管理员，与用户应答通道分开
    fn notify_drift(report: &RefreshReport, orch: &Arc<Orchestrator>, bot: &Arc<RuntimeBot>) {
        if report.empty_value_keys.is_empty() {
            return;
        }
        kovi::log::warn!("nickname.json 存在空值，请及时更新");
        kovi::log::debug!("空值列表: {:?}", report.empty_value_keys);
        let msg = format!(
            "nickname.json 存在空值，请及时更新\n空值列表: {:?}\n检查时间: {}",
            report.empty_value_keys,
            report.finished_at.format("%Y-%m-%d %H:%M:%S"),
        );
        for user_id in orch.superusers() {
            bot.send_private_msg(*user_id, msg.as_str());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_query_command() {
            assert_eq!(parse_command("乐土人律"), Some(Cmd::Query("人律".into())));
            assert_eq!(parse_command("/乐土人律"), Some(Cmd::Query("人律".into())));
            assert_eq!(
                parse_command("  乐土 人律 "),
                Some(Cmd::Query("人律".into()))
            );
        }

        #[test]
        fn parses_admin_commands() {
            assert_eq!(parse_command("乐土更新"), Some(Cmd::Update));
            assert_eq!(parse_command("/乐土更新"), Some(Cmd::Update));
            assert_eq!(parse_command("乐土状态"), Some(Cmd::Status));
            assert_eq!(parse_command("乐土"), Some(Cmd::Help));
            assert_eq!(parse_command("乐土帮助"), Some(Cmd::Help));
        }

        #[test]
        fn parses_set_alias_command() {
            assert_eq!(
                parse_command("乐土昵称 Human 人律,爱律"),
                Some(Cmd::SetAlias {
                    key: "Human".into(),
                    aliases: vec!["人律".into(), "爱律".into()],
                })
            );
            assert_eq!(
                parse_command("乐土昵称 Human"),
                Some(Cmd::SetAlias {
                    key: "Human".into(),
                    aliases: vec![],
                })
            );
        }

        #[test]
        fn ignores_unrelated_text() {
            assert_eq!(parse_command("你好"), None);
            assert_eq!(parse_command(""), None);
        }

        #[test]
        fn splits_alias_lists() {
            assert_eq!(split_aliases("a, b,c"), vec!["a", "b", "c"]);
            assert_eq!(split_aliases("人律，爱律"), vec!["人律", "爱律"]);
            assert_eq!(split_aliases(""), Vec::<String>::new());
            assert_eq!(split_aliases(" "), Vec::<String>::new());
        }
    }
}

// --- 入口 ---
use kovi::PluginBuilder;
use std::sync::Arc;

#[kovi::plugin]
async fn main() {
    let bot = PluginBuilder::get_runtime_bot();
    let data_dir = bot.get_data_path();
    let cfg = config::Config::load(&data_dir);
    let orch = Arc::new(logic::Orchestrator::new(cfg, data_dir));

    // 启动即同步一次，此后按配置间隔巡检
    {
        let orch = orch.clone();
        let bot = bot.clone();
        kovi::tokio::spawn(async move {
            loop {
                logic::run_cycle(&orch, &bot).await;
                kovi::tokio::time::sleep(std::time::Duration::from_secs(orch.refresh_interval()))
                    .await;
            }
        });
    }

    let orch_msg = orch.clone();
    PluginBuilder::on_msg(move |event| {
        let orch = orch_msg.clone();
        let bot = bot.clone();
        async move {
            let raw = match event.borrow_text() {
                Some(v) => v,
                None => return,
            };
            if let Some(cmd) = logic::parse_command(raw) {
                logic::execute(cmd, &event, &orch, &bot).await;
            }
        }
    });
}
