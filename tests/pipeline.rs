// End-to-end run of the file-backed stages: consolidate the yearly exam
// files, normalize the PIB export, and join them. The destination load is
// exercised separately against a live database.

use anyhow::Result;
use saberetl::config::PipelineConfig;
use saberetl::{consolidate, lookup, merge};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn test_config(dir: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::from_env();
    cfg.data_dir = dir.to_path_buf();
    cfg.staging_dir = dir.join("staging");
    cfg.debug_dir = dir.join("debug");
    cfg
}

#[test]
fn consolidate_lookup_and_merge_chain_together() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = test_config(tmp.path());

    // Two exam years; the 2019 file uses semicolons to exercise the
    // sniffer, and one of its rows has an unusable department code.
    fs::write(
        tmp.path().join("Examen_Saber_11_2019.csv"),
        "PERIODO;COLE_COD_DEPTO_UBICACION;PUNT_GLOBAL\n\
         20194;5;300\n\
         20194;11;280\n\
         20194;;999\n",
    )?;
    fs::write(
        tmp.path().join("Examen_Saber_11_2018.csv"),
        "PERIODO,COLE_COD_DEPTO_UBICACION,PUNT_GLOBAL\n\
         20181,8,250\n",
    )?;
    // PIB covers (2019, 5) twice (summed) and (2018, 8); (2019, 11) is a
    // genuine gap.
    fs::write(
        cfg.lookup_raw_path(),
        "a_o,c_digo_departamento_divipola,departamento,valor_miles_de_millones_de\n\
         2019,5,Antioquia,70000\n\
         2019,5,Antioquia,50000\n\
         2018,8,Atlantico,\"60000,5\"\n",
    )?;

    let consolidated = consolidate::run(&cfg, None, None)?;
    assert_eq!(consolidated.rows, 3);
    assert_eq!(consolidated.files_processed, 2);
    assert_eq!(consolidated.years, vec![2018, 2019]);

    let raw = cfg.lookup_raw_path();
    let (lookup_summary, table) = lookup::run(&cfg, &raw, None)?;
    assert_eq!(lookup_summary.rows, 2);
    assert_eq!(table.get(2019, 5).unwrap().value, 120000.0);

    let merged = merge::run(&cfg, &consolidated.path, &table, None)?;
    // Left join: every consolidated row survives exactly once.
    assert_eq!(merged.total_rows, consolidated.rows);
    assert_eq!(merged.rows_with_value, 2);
    assert_eq!(merged.rows_without_value, 1);
    assert!(merged.coverage_ratio > 0.66 && merged.coverage_ratio < 0.67);

    // Output order follows file year, and the value column carries the
    // aggregated PIB.
    let mut rdr = csv::ReaderBuilder::new().from_path(&merged.path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    assert_eq!(headers.last().unwrap(), merge::VALUE_FIELD);
    let rows: Vec<Vec<String>> = rdr
        .records()
        .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(rows[0][0], "2018");
    assert_eq!(rows[0].last().unwrap(), "60000.5");
    assert_eq!(rows[1][0], "2019");
    assert_eq!(rows[1].last().unwrap(), "120000");
    assert_eq!(rows[2].last().unwrap(), "");
    Ok(())
}
