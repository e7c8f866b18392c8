pub mod density_panel;
pub mod figure;
pub mod statistics;
