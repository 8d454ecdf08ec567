//! Interface de linha de comando do gridflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, config,
//! resources) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// gridflow: ciclo de vida de jobs em recursos computacionais remotos.
#[derive(Debug, Parser)]
#[command(name = "gridflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `gridflow.toml`).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa tarefas simuladas no backend noop até todas terminarem.
    Demo {
        /// Número de tarefas a criar.
        #[arg(long, default_value_t = 8)]
        tasks: usize,

        /// Pausa entre ciclos de `progress`, em milissegundos.
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,

        /// Sobrescreve `engine.max_in_flight` da configuração.
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Sobrescreve `engine.max_submitted` da configuração.
        #[arg(long)]
        max_submitted: Option<usize>,

        /// Diretório onde a saída das tarefas é baixada.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Diretório onde os registros das tarefas são salvos em JSON.
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Mostra a configuração efetiva em TOML.
    Config,

    /// Lista os recursos configurados.
    Resources,
}
