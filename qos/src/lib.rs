#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use qos_common::*;
pub use qos_tc as tc;

pub use qos_dba as dba;
pub use qos_mon as mon;

pub mod pid;
