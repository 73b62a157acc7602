//! Operações Git locais via libgit2: branch da tarefa, commits, push e diff.
//!
//! O [`GitManager`] é síncrono; quem roda dentro do runtime async deve
//! chamá-lo via `spawn_blocking`.

use anyhow::{Context, Result, bail};
use git2::{
    BranchType, Cred, CredentialType, DiffStatsFormat, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use std::cell::Cell;
use std::path::Path;
use tracing::{debug, info};

/// Arquivos nunca adicionados ao stage, para não vazar segredos.
const EXCLUDED_FILES: [&str; 4] = ["config.toml", ".env", ".env.local", ".netrc"];

/// Credenciais usadas no push (HTTPS); SSH usa o agente do sistema.
#[derive(Debug, Clone, Default)]
pub struct PushAuth {
    pub username: String,
    pub password: String,
}

/// Gerenciador de operações Git usando a biblioteca libgit2.
pub struct GitManager {
    repo: Repository,
}

fn is_excluded(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    EXCLUDED_FILES.contains(&name) || name.ends_with(".key") || name.ends_with(".pem")
}

impl GitManager {
    /// Abre um repositório git existente no caminho fornecido.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("failed to open git repository at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Faz checkout da branch da tarefa, criando-a se necessário.
    ///
    /// Uma branch nova parte de `base` local, depois `origin/<base>`, e por
    /// fim do HEAD atual. Uma branch existente é reaproveitada como está.
    pub fn prepare_branch(&self, name: &str, base: &str) -> Result<()> {
        if self.repo.find_branch(name, BranchType::Local).is_err() {
            let start = self
                .repo
                .find_branch(base, BranchType::Local)
                .or_else(|_| {
                    self.repo
                        .find_branch(&format!("origin/{base}"), BranchType::Remote)
                })
                .ok()
                .map(|b| b.get().peel_to_commit())
                .transpose()?;
            let start = match start {
                Some(commit) => commit,
                None => {
                    debug!(base, "base branch not found, branching from HEAD");
                    self.repo.head()?.peel_to_commit()?
                }
            };
            self.repo.branch(name, &start, false)?;
            info!(branch = name, from = %start.id(), "created task branch");
        }

        let refname = format!("refs/heads/{name}");
        self.repo.set_head(&refname)?;
        self.repo
            .checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        Ok(())
    }

    /// Adiciona todas as alterações ao stage e cria um commit.
    ///
    /// Retorna o hash curto, ou `None` quando não há nada a commitar.
    /// Arquivos sensíveis (config.toml, .env, *.key, ...) ficam de fora.
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                if is_excluded(path) { 1 } else { 0 }
            }),
        )?;
        // Remoções não são cobertas por add_all.
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = self.repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_oid {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("task-orchestrator", "task-orchestrator@localhost"))?;

        let commit_oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

        let short = &commit_oid.to_string()[..7];
        Ok(Some(short.to_string()))
    }

    /// Envia a branch para `origin`.
    pub fn push(&self, branch: &str, auth: &PushAuth) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .context("repository has no 'origin' remote")?;

        let attempts = Cell::new(0u8);
        let rejection = Cell::new(None::<String>);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed| {
            attempts.set(attempts.get() + 1);
            if attempts.get() > 3 {
                return Err(git2::Error::from_str("credentials rejected"));
            }
            if allowed.contains(CredentialType::SSH_KEY) {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
                && !auth.username.is_empty()
            {
                Cred::userpass_plaintext(&auth.username, &auth.password)
            } else {
                Cred::default()
            }
        });
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejection.set(Some(format!("{refname}: {message}")));
            }
            Ok(())
        });

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut options))?;

        if let Some(reason) = rejection.take() {
            bail!("push rejected: {reason}");
        }
        info!(branch, "pushed branch");
        Ok(())
    }

    /// URL do remote `origin`, se existir.
    pub fn origin_url(&self) -> Result<Option<String>> {
        match self.repo.find_remote("origin") {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Estatísticas de diff entre `base` (ou o commit pai) e o HEAD.
    pub fn diff_summary(&self, base: &str) -> Result<String> {
        let head = self.repo.head()?.peel_to_commit()?;
        let base_tree = match self.repo.find_branch(base, BranchType::Local) {
            Ok(branch) => Some(branch.get().peel_to_commit()?.tree()?),
            Err(_) => match head.parent(0) {
                Ok(parent) => Some(parent.tree()?),
                Err(_) => None,
            },
        };
        let diff = self
            .repo
            .diff_tree_to_tree(base_tree.as_ref(), Some(&head.tree()?), None)?;
        let buf = diff.stats()?.to_buf(DiffStatsFormat::FULL, 80)?;
        Ok(buf.as_str().unwrap_or("").trim_end().to_string())
    }
}
