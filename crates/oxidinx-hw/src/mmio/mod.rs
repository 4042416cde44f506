pub mod fermi_2d;
