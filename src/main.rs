use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eframe::egui;
use egui_plot::{Bar, BarChart, Plot};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{error, info, warn};

use conv_stepper::config::{init_tracing, ViewerConfig};
use conv_stepper::feature_map::SOURCE_DIM;
use conv_stepper::geometry::DisplayRect;
use conv_stepper::{
    AnimationState, Direction, EngineSession, ParamsUpdate, PoolMode, SessionParams, SourceImage,
};

#[derive(Parser)]
#[command(name = "conv-stepper")]
#[command(about = "Step through a convolutional pipeline one output cell at a time")]
#[command(version)]
struct Cli {
    /// Source image to convolve; random noise is used when omitted
    #[arg(long)]
    image: Option<PathBuf>,
    /// Viewer settings as JSON
    #[arg(long)]
    config: Option<PathBuf>,
    /// Layer to focus on start
    #[arg(long, default_value_t = 0)]
    layer: isize,
    /// Seed for the noise image
    #[arg(long, default_value_t = 7)]
    noise_seed: u64,
}

/// A reproducible random RGB picture, so there is something to convolve without a file.
fn noise_source(seed: u64) -> conv_stepper::Result<SourceImage> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity((SOURCE_DIM * SOURCE_DIM * 4) as usize);
    for _ in 0..SOURCE_DIM * SOURCE_DIM {
        data.extend_from_slice(&[rng.r#gen(), rng.r#gen(), rng.r#gen(), 255]);
    }
    SourceImage::from_rgba(SOURCE_DIM, SOURCE_DIM, data)
}

const ARROW_KEYS: [(egui::Key, Direction); 4] = [
    (egui::Key::ArrowLeft, Direction::Left),
    (egui::Key::ArrowRight, Direction::Right),
    (egui::Key::ArrowUp, Direction::Up),
    (egui::Key::ArrowDown, Direction::Down),
];

struct SimulatorApp {
    session: EngineSession,
    status: String,
    speed: u32,
    noise_seed: u64,
}

impl SimulatorApp {
    fn new(session: EngineSession, speed: u32, noise_seed: u64) -> Self {
        Self {
            session,
            status: "Ready".into(),
            speed,
            noise_seed,
        }
    }

    fn report<T>(&mut self, result: conv_stepper::Result<T>) {
        if let Err(err) = result {
            warn!(%err, "operation rejected");
            self.status = err.to_string();
        }
    }

    fn draw_layer_nav(&mut self, ui: &mut egui::Ui) {
        let layer = self.session.current_layer();
        ui.heading(&layer.name);
        ui.label(format!("Role: {}", layer.role()));
        ui.label(format!(
            "{}x{}x{} → {}x{} (nominal), bias {:+.2}",
            layer.input_dim, layer.input_dim, layer.input_channels, layer.output_dim, layer.output_dim, layer.bias
        ));
        ui.add(
            egui::ProgressBar::new(layer.coverage_percent() as f32 / 100.0)
                .text(format!("{}px receptive field", layer.receptive_field)),
        );
        ui.horizontal(|ui| {
            if ui.add_enabled(self.session.has_previous(), egui::Button::new("◀ Prev")).clicked() {
                let result = self.session.focus_previous();
                self.report(result);
            }
            if ui.add_enabled(self.session.has_next(), egui::Button::new("Next ▶")).clicked() {
                let result = self.session.focus_next();
                self.report(result);
            }
            if ui.button("Reset").clicked() {
                let result = self.session.reset();
                self.report(result);
            }
        });
    }

    fn draw_param_editor(&mut self, ui: &mut egui::Ui) {
        ui.separator();
        ui.heading("Parameters");
        let current: SessionParams = *self.session.params();
        let mut edited = current;
        egui::Grid::new("params").num_columns(2).show(ui, |ui| {
            ui.label("Kernel:");
            ui.add(egui::DragValue::new(&mut edited.kernel_size).range(1..=9));
            ui.end_row();
            ui.label("Filters:");
            ui.add(egui::DragValue::new(&mut edited.output_channels).range(1..=512));
            ui.end_row();
            ui.label("Stride:");
            ui.add(egui::DragValue::new(&mut edited.stride).range(1..=4));
            ui.end_row();
            ui.label("Padding:");
            ui.add(egui::DragValue::new(&mut edited.padding).range(0..=4));
            ui.end_row();
            ui.label("Pooling:");
            egui::ComboBox::from_id_salt("pool")
                .selected_text(match edited.pool {
                    PoolMode::None => "none",
                    PoolMode::Avg => "avg",
                })
                .show_ui(ui, |ui| {
                    ui.selectable_value(&mut edited.pool, PoolMode::None, "none");
                    ui.selectable_value(&mut edited.pool, PoolMode::Avg, "avg");
                });
            ui.end_row();
        });
        if edited != current {
            let update = ParamsUpdate {
                kernel_size: Some(edited.kernel_size),
                stride: Some(edited.stride),
                padding: Some(edited.padding),
                output_channels: Some(edited.output_channels),
                pool: Some(edited.pool),
                activation: None,
            };
            let result = self.session.set_session_params(&update);
            self.report(result);
        }
        if ui
            .selectable_label(current.activation == conv_stepper::Activation::Relu, current.activation.label())
            .clicked()
        {
            let result = self.session.toggle_activation();
            self.report(result);
        }
        if self.session.params_overridden() {
            ui.small("Overrides apply to this layer only");
        }
    }

    fn draw_playback(&mut self, ui: &mut egui::Ui) {
        ui.separator();
        if ui.add(egui::Slider::new(&mut self.speed, 0..=1000).text("Speed")).changed() {
            self.session.set_speed(self.speed);
        }
        ui.horizontal(|ui| {
            let play_label = match self.session.state() {
                AnimationState::Playing => "⏸ Pause",
                AnimationState::Finished => "Finished",
                _ => "▶ Play",
            };
            if ui.button(play_label).clicked() {
                self.session.toggle_play();
            }
            let paused = self.session.state() == AnimationState::Paused;
            if ui.add_enabled(paused, egui::Button::new("Step")).clicked() {
                self.session.step();
            }
            if ui.button("Finish").clicked() {
                let result = self.session.finish_layer();
                self.report(result);
            }
        });
        if ui.button("New noise image").clicked() {
            self.noise_seed = self.noise_seed.wrapping_add(1);
            let result = noise_source(self.noise_seed).and_then(|source| self.session.set_source_image(source));
            self.report(result);
        }
    }

    fn draw_input_canvas(&mut self, ui: &mut egui::Ui) {
        let size = self.session.display_size_px();
        let (response, painter) = ui.allocate_painter(egui::vec2(size, size), egui::Sense::click_and_drag());
        let origin = response.rect.min;
        let input = self.session.input();
        paint_cells(&painter, origin, size, input.dim(), |x, y| {
            input.get(x, y).map(|v| v.floor() as u8).unwrap_or(0)
        });
        stroke_rect(&painter, response.rect, egui::Stroke::new(1.0, egui::Color32::DARK_GRAY));
        if self.session.state() != AnimationState::Idle {
            let rf = display_rect(origin, self.session.receptive_field_display());
            stroke_rect(ui.painter(), rf, egui::Stroke::new(2.0, egui::Color32::YELLOW));
        }

        if response.is_pointer_button_down_on() {
            if let Some(pos) = response.interact_pointer_pos() {
                let rel = pos - origin;
                self.session.probe_at(rel.x, rel.y);
            }
        }
    }

    fn draw_output_canvas(&mut self, ui: &mut egui::Ui) {
        let size = self.session.display_size_px();
        let (response, painter) = ui.allocate_painter(egui::vec2(size, size), egui::Sense::hover());
        let origin = response.rect.min;
        let output = self.session.output();
        paint_cells(&painter, origin, size, output.dim(), |x, y| output.display_value(x, y));
        stroke_rect(&painter, response.rect, egui::Stroke::new(1.0, egui::Color32::DARK_GRAY));
        if self.session.state() != AnimationState::Idle {
            let hl = display_rect(origin, self.session.highlight_display());
            stroke_rect(&painter, hl, egui::Stroke::new(2.0, egui::Color32::from_rgb(100, 200, 255)));
        }
    }

    fn draw_kernel(&self, ui: &mut egui::Ui) {
        ui.label(format!("Layer {} filter", self.session.layer_index()));
        egui::Grid::new("kernel").show(ui, |ui| {
            for row in self.session.kernel_weights() {
                for w in row {
                    ui.monospace(format!("{w:+.1}"));
                }
                ui.end_row();
            }
        });
    }

    fn draw_diagnostic(&self, ui: &mut egui::Ui) {
        ui.separator();
        ui.heading("Dot product");
        match self.session.last_diagnostic() {
            Some(diag) => {
                egui::ScrollArea::vertical().max_height(120.0).show(ui, |ui| {
                    ui.add(egui::Label::new(egui::RichText::new(diag.terms_text()).monospace()).wrap());
                });
                ui.label(format!("+ bias {}", diag.bias_text()));
                ui.strong(format!("= {}", diag.result_text()));
            }
            None => {
                ui.label("Hover input to see full dot product...");
            }
        }
    }

    fn draw_histogram(&self, ui: &mut egui::Ui) {
        let mut counts = [0u32; 16];
        for v in self.session.output().filled_values() {
            counts[((v as usize) / 16).min(15)] += 1;
        }
        let bars = counts
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(i as f64 * 16.0 + 8.0, c as f64).width(14.0))
            .collect();
        Plot::new("activation_histogram")
            .height(120.0)
            .allow_zoom(false)
            .allow_drag(false)
            .show(ui, |plot_ui| plot_ui.bar_chart(BarChart::new(bars)));
    }
}

impl eframe::App for SimulatorApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let dt = ctx.input(|i| i.stable_dt).max(0.0);
        self.session.advance(Duration::from_secs_f32(dt));
        for (key, direction) in ARROW_KEYS {
            if ctx.input(|i| i.key_pressed(key)) {
                self.session.move_cursor(direction);
            }
        }

        egui::SidePanel::left("controls").show(ctx, |ui| {
            ui.label(&self.status);
            ui.separator();
            self.draw_layer_nav(ui);
            self.draw_param_editor(ui);
            self.draw_playback(ui);
        });
        egui::CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                ui.horizontal(|ui| {
                    ui.vertical(|ui| {
                        let dim = self.session.input().dim();
                        ui.label(format!("Input ({dim}x{dim})"));
                        self.draw_input_canvas(ui);
                    });
                    ui.vertical(|ui| self.draw_kernel(ui));
                    ui.vertical(|ui| {
                        let dim = self.session.output_dim();
                        ui.label(format!("Map {} ({dim}x{dim})", self.session.layer_index()));
                        self.draw_output_canvas(ui);
                    });
                });
                self.draw_diagnostic(ui);
                self.draw_histogram(ui);
            });
        });

        if self.session.state() == AnimationState::Playing {
            ctx.request_repaint();
        }
    }
}

fn paint_cells(painter: &egui::Painter, origin: egui::Pos2, size: f32, dim: usize, value: impl Fn(usize, usize) -> u8) {
    if dim == 0 {
        return;
    }
    let scale = size / dim as f32;
    for y in 0..dim {
        for x in 0..dim {
            let min = origin + egui::vec2(x as f32 * scale, y as f32 * scale);
            let rect = egui::Rect::from_min_size(min, egui::vec2(scale, scale));
            painter.rect_filled(rect, 0.0, egui::Color32::from_gray(value(x, y)));
        }
    }
}

fn display_rect(origin: egui::Pos2, rect: DisplayRect) -> egui::Rect {
    egui::Rect::from_min_size(origin + egui::vec2(rect.left, rect.top), egui::vec2(rect.width, rect.height))
}

// Outline drawn by hand, one segment per side.
fn stroke_rect(painter: &egui::Painter, rect: egui::Rect, stroke: egui::Stroke) {
    let (lt, rt, lb, rb) = (rect.left_top(), rect.right_top(), rect.left_bottom(), rect.right_bottom());
    painter.line_segment([lt, rt], stroke);
    painter.line_segment([rt, rb], stroke);
    painter.line_segment([rb, lb], stroke);
    painter.line_segment([lb, lt], stroke);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(err) = init_tracing() {
        eprintln!("{err}");
    }
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::default(),
    };
    let mut session = EngineSession::new(config.catalog()?)?.with_display_size(config.display_size_px);
    session.set_speed(config.speed);

    let source = match &cli.image {
        Some(path) => SourceImage::open(path)?,
        None => noise_source(cli.noise_seed)?,
    };
    session.set_source_image(source)?;
    if let Err(err) = session.focus_layer(cli.layer) {
        error!(%err, "could not focus requested layer, staying on layer 0");
    }
    info!(layers = session.catalog().len(), "starting viewer");

    let app = SimulatorApp::new(session, config.speed, cli.noise_seed);
    let options = eframe::NativeOptions::default();
    eframe::run_native("Conv Stepper", options, Box::new(|_cc| Ok(Box::new(app))))?;
    Ok(())
}
