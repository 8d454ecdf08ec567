//! Interface de terminal do gridflow: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra e `console` para as cores. O
//! [`EngineProgress`] acompanha os ciclos de `progress` do engine.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use gridflow::{RunState, Stats};

/// Barra de progresso das tarefas de um engine.
///
/// A posição é o número de tarefas TERMINATED; a mensagem resume as
/// contagens por estado.
pub struct EngineProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl EngineProgress {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a barra com as contagens do último ciclo.
    pub fn update(&self, cycle: u64, stats: &Stats) {
        self.pb.set_length(stats.total as u64);
        self.pb.set_position(stats.count(RunState::Terminated) as u64);
        self.pb.set_message(format!(
            "ciclo {cycle}: {} new, {} submitted, {} running, {} terminating",
            stats.count(RunState::New),
            stats.count(RunState::Submitted),
            stats.count(RunState::Running),
            stats.count(RunState::Terminating),
        ));
    }

    /// Mostra um erro de ciclo sem interromper a barra.
    pub fn warn(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza a barra e mostra o resultado.
    pub fn finish(&self, stats: &Stats) {
        self.pb.finish_and_clear();
        println!(
            "  {} {} tarefa(s) concluída(s) com sucesso",
            self.green.apply_to("✓"),
            stats.ok
        );
        if stats.failed > 0 {
            println!(
                "  {} {} tarefa(s) falharam",
                self.red.apply_to("✗"),
                stats.failed
            );
        }
    }

    /// Imprime as estatísticas finais em JSON.
    pub fn print_stats(&self, stats: &Stats) {
        println!();
        println!("{}", self.yellow.apply_to("─── Stats ───"));
        println!("{}", serde_json::to_string_pretty(stats).unwrap_or_default());
    }
}
