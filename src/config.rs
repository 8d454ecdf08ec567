//! Configuração do gridflow carregada a partir de `gridflow.toml`.
//!
//! A struct [`GridConfig`] agrupa as opções do engine (`[engine]`), do core
//! (`[core]`), a lista `no_catch_errors` e os recursos (`[[resources]]`).
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `GRIDFLOW_NO_CATCH_ERRORS` complementa
//! `no_catch_errors` quando o core monta sua política de erros.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::ResourceSpec;
use crate::error::{GridError, Result};

/// Arquivo lido por [`GridConfig::load`] quando nenhum caminho é dado.
pub const DEFAULT_CONFIG_FILE: &str = "gridflow.toml";

/// Configuração de nível superior carregada de `gridflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Palavras-chave de erros que nunca devem ser ignorados.
    #[serde(default)]
    pub no_catch_errors: Vec<String>,

    #[serde(default)]
    pub engine: EngineOptions,

    #[serde(default)]
    pub core: CoreOptions,

    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Limites e comportamento do ciclo `progress` do engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Permite submeter tarefas NEW.
    pub can_submit: bool,

    /// Permite baixar a saída de tarefas TERMINATING.
    pub can_retrieve: bool,

    /// Máximo de jobs SUBMITTED ou RUNNING; 0 significa sem limite.
    pub max_in_flight: usize,

    /// Máximo de jobs SUBMITTED; 0 significa sem limite.
    pub max_submitted: usize,

    /// Diretório base para a saída; cada tarefa ganha um subdiretório.
    pub output_dir: Option<PathBuf>,

    /// Baixa também a saída parcial de tarefas RUNNING.
    pub retrieve_running: bool,

    pub retrieve_overwrites: bool,

    pub retrieve_changed_only: bool,

    /// Deixa de gerenciar tarefas assim que terminam, em vez de
    /// guardá-las no grupo TERMINATED.
    pub forget_terminated: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            can_submit: true,
            can_retrieve: true,
            max_in_flight: 0,
            max_submitted: 0,
            output_dir: None,
            retrieve_running: false,
            retrieve_overwrites: false,
            retrieve_changed_only: true,
            forget_terminated: false,
        }
    }
}

/// Comportamento das operações síncronas do core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreOptions {
    /// Aplica UNKNOWN já na primeira falha de consulta ao backend.
    pub update_on_error: bool,

    /// Após N falhas consecutivas a tarefa vai para UNKNOWN mesmo sem
    /// `update_on_error`; 0 desativa.
    pub unknown_after_failures: u32,

    /// Atualiza o status do recurso mesmo quando há um único candidato.
    pub refresh_single_candidate: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            update_on_error: false,
            unknown_after_failures: 0,
            refresh_single_candidate: true,
        }
    }
}

impl GridConfig {
    /// Carrega a configuração de `path`, ou de `gridflow.toml` no diretório
    /// atual. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: GridConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejeita nomes de recurso vazios ou repetidos.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.resources {
            if spec.name.trim().is_empty() {
                return Err(GridError::Configuration(
                    "resource with empty name".to_string(),
                ));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(GridError::Configuration(format!(
                    "resource '{}' defined more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GridError::Configuration(format!("cannot serialize configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = GridConfig::default();
        assert!(config.engine.can_submit);
        assert!(config.engine.can_retrieve);
        assert_eq!(config.engine.max_in_flight, 0);
        assert!(!config.engine.forget_terminated);
        assert!(config.core.refresh_single_candidate);
        assert_eq!(config.core.unknown_after_failures, 0);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            no_catch_errors = ["fetch_output"]

            [engine]
            max_in_flight = 10

            [core]
            unknown_after_failures = 3

            [[resources]]
            name = "cluster-a"
            max_cores = 64

            [[resources]]
            name = "cluster-b"
            enabled = false
        "#;
        let config = GridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.engine.max_in_flight, 10);
        assert!(config.engine.can_submit);
        assert_eq!(config.core.unknown_after_failures, 3);
        assert!(!config.core.update_on_error);
        assert_eq!(config.no_catch_errors, vec!["fetch_output"]);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].max_cores, 64);
        assert!(!config.resources[1].enabled);
    }

    #[test]
    fn duplicate_resource_names_are_rejected() {
        let toml_str = r#"
            [[resources]]
            name = "a"
            [[resources]]
            name = "a"
        "#;
        let err = GridConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn load_reads_given_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[engine]\nmax_submitted = 4\n").unwrap();
        let config = GridConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine.max_submitted, 4);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GridConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.engine, EngineOptions::default());
    }

    #[test]
    fn toml_output_reparses() {
        let mut config = GridConfig::default();
        config.resources.push(ResourceSpec::new("local"));
        let text = config.to_toml_string().unwrap();
        let back = GridConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.resources[0].name, "local");
    }
}
