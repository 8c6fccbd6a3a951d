//! Switching spectroscopy PFM processing: raw datacube files to nanoloop
//! tables (`datacube`), then nanoloop tables to per-pixel hysteresis and
//! electrostatic property maps (`nanoloop`).

#[macro_use]
mod sspfm_macros;

pub mod sspfm_analysis;
pub mod sspfm_config;
pub mod sspfm_cut;
pub mod sspfm_datacube;
pub mod sspfm_dispatch;
pub mod sspfm_electrostatic;
pub mod sspfm_error;
pub mod sspfm_filter;
pub mod sspfm_fitting;
pub mod sspfm_hysteresis;
pub mod sspfm_logger;
pub mod sspfm_models;
pub mod sspfm_nanoloop;
pub mod sspfm_output;
pub mod sspfm_phase;
pub mod sspfm_plot;
pub mod sspfm_properties;
pub mod sspfm_read;
pub mod sspfm_segment;
pub mod sspfm_select;
pub mod sspfm_settings;
pub mod sspfm_signal;
pub mod sspfm_utils;
