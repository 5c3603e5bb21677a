#![allow(non_snake_case)]

//! Ground states of one-dimensional lattice Hamiltonians by two-site density
//! matrix renormalization group (DMRG) on matrix product states.
//!
//! The Hamiltonian is given as a matrix product operator through an
//! [`OperatorProvider`][mpo::OperatorProvider]. Site tensors, bond spectra,
//! and environment blocks are kept in [`TensorStore`][store::TensorStore]s,
//! which hold tensors in memory up to a byte budget and spill the rest to
//! per-run files on disk. The [`DMRG`][dmrg::DMRG] engine grows the chain
//! from its ends, sweeps it to convergence, and finishes with a measurement
//! pass during which [`obs`] functions can be evaluated.

pub mod tensor;
pub mod overflow;
pub mod store;

pub mod mpo;
pub mod mps;
pub mod env;
pub mod effh;
pub mod lanczos;
pub mod truncate;
pub mod schedule;
pub mod dmrg;
pub mod obs;

pub use dmrg::{ DMRG, DMRGConfig, DMRGError, DMRGResult, Phase, StepRecord, Summary };
pub use mpo::{ IdentityMPO, OperatorProvider, SUSY, TFIM };
pub use schedule::Direction;
pub use store::{ StoreConfig, TensorStore };
