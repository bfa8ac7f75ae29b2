pub mod debugger_exos;
pub mod debugger_exos_memview;
pub mod debugger_exos_ppc;
