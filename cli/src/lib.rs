//! pack CLI - build and rebase application images with buildpacks.

pub mod commands;
