//! # SuriBrows Policy — moteur de politique par session
//!
//! Processus compagnon du navigateur : il décide, pour chaque contexte de
//! navigation nommé, ce qui arrive aux requêtes réseau, aux téléchargements
//! et aux demandes de permission.
//!
//! ## Architecture des modules
//!
//! - [`session`] : Coordinateur. Possède l'état de politique et compose les
//!   composants ci-dessous pour chaque session.
//!
//! - [`redirect`] : Réécriture d'URL par règles `motif~remplacement`.
//!
//! - [`filter`] : Filtrage réseau et cosmétique via le crate `adblock` (Brave),
//!   listes EasyList/EasyPrivacy mises en cache localement.
//!
//! - [`download`] : Suivi des téléchargements (machine d'états, persistance,
//!   reprise après crash).
//!
//! - [`permission`] : Arbitrage des permissions en trois niveaux (règles,
//!   défauts, prompt).
//!
//! - [`prompt`], [`notify`] : Services de dialogue et de notification
//!   fournis par l'hôte.
//!
//! - [`protocol`] : Pont JSON ligne par ligne avec le processus hôte.
//!
//! - [`storage`], [`net`], [`favicon`] : Fichiers sous le dossier de données,
//!   accès HTTP, favicons.
//!
//! - [`config`] : Configuration TOML au démarrage.

pub mod config;
pub mod download;
pub mod error;
pub mod favicon;
pub mod filter;
pub mod net;
pub mod notify;
pub mod permission;
pub mod prompt;
pub mod protocol;
pub mod redirect;
pub mod session;
pub mod storage;
