pub(crate) mod detect_utils;
pub mod nikto;
pub mod nikto_process;
pub mod nmap;
pub mod nmap_process;
pub mod nuclei;
pub mod nuclei_process;
pub mod null;
pub(crate) mod process_utils;
pub mod sqlmap;
pub mod sqlmap_process;
pub mod tool;
pub mod trivy;
pub mod trivy_process;
pub mod zap;
pub mod zap_http;

pub use nikto::{NIKTO_DESCRIPTOR, NiktoAdapter, NiktoSource, nikto_scan_request};
pub use nikto_process::ProcessNiktoSource;
pub use nmap::{NMAP_DESCRIPTOR, NmapAdapter, NmapSource, nmap_scan_request};
pub use nmap_process::ProcessNmapSource;
pub use nuclei::{NUCLEI_DESCRIPTOR, NucleiAdapter, NucleiSource, nuclei_scan_request};
pub use nuclei_process::ProcessNucleiSource;
pub use null::NullAdapter;
pub use sqlmap::{SQLMAP_DESCRIPTOR, SqlmapAdapter, SqlmapSource, sqlmap_request};
pub use sqlmap_process::ProcessSqlmapSource;
pub use tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
pub use trivy::{TRIVY_DESCRIPTOR, TrivyAdapter, TrivySource, trivy_image_request};
pub use trivy_process::ProcessTrivySource;
pub use zap::{ZAP_DESCRIPTOR, ZapAdapter, ZapScan, ZapSource};
pub use zap_http::HttpZapSource;
