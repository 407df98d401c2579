//! Mapping files for barcoded amplicon sequencing runs.
//!
//! Each sample is amplified with a unique pair of Golay-barcoded primers.
//! A sample sheet names the pair per sample (e.g. `515F_Golay001` and
//! `926RBC_Golay252`), and primer tables give their sequences and barcodes.
//! The mapping file joins the two: the sample id is
//! `<run>.<forward number>.<reverse number>` and the combined barcode is
//! the forward barcode followed by the reverse complement of the reverse
//! barcode.
//!
use bio::alphabets::dna;
use csv::StringRecord;
use indexmap::IndexMap;
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::error::CfxError;
use crate::file::InputFile;
use crate::plate::column_index;

/// One primer with its barcode.
#[derive(Debug, Clone, PartialEq)]
pub struct Primer {
    pub name: String,
    pub sequence: String,
    pub barcode: String,
    /// Linker/primer sequence, listed for forward primers.
    pub linker: Option<String>,
}

/// Primers keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimerTable {
    pub primers: IndexMap<String, Primer>,
}

#[derive(Debug, Deserialize)]
struct ForwardPrimerEntry {
    #[serde(rename = "Forward_primer")]
    name: String,
    #[serde(rename = "ForwardPrimer")]
    sequence: String,
    #[serde(rename = "Barcode_Forward_Primer")]
    barcode: String,
    #[serde(rename = "LinkerPrimerSequence", default)]
    linker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReversePrimerEntry {
    #[serde(rename = "Reverse_primer")]
    name: String,
    #[serde(rename = "ReversePrimer")]
    sequence: String,
    #[serde(rename = "Barcode_Reverse_Primer")]
    barcode: String,
}

fn check_barcode(primer: &str, barcode: &str) -> Result<(), CfxError> {
    if barcode.is_empty() || !dna::iupac_alphabet().is_word(barcode.as_bytes()) {
        return Err(CfxError::ParseError(format!(
            "primer '{}' has an invalid barcode '{}'",
            primer, barcode
        )));
    }
    Ok(())
}

impl PrimerTable {
    pub fn new() -> Self {
        Self {
            primers: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, primer: Primer) -> Result<(), CfxError> {
        check_barcode(&primer.name, &primer.barcode)?;
        self.primers.insert(primer.name.clone(), primer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Primer, CfxError> {
        self.primers
            .get(name)
            .ok_or_else(|| CfxError::UnknownPrimer(name.to_string()))
    }

    /// Read a forward primer table (`Forward_primer`, `ForwardPrimer`,
    /// `Barcode_Forward_Primer`, optional `LinkerPrimerSequence`).
    pub fn forward_from_csv<P: AsRef<Path>>(
        filepath: P,
        delimiter: u8,
    ) -> Result<PrimerTable, CfxError> {
        let mut rdr = InputFile::new(filepath.as_ref()).csv_reader(delimiter)?;
        let mut table = PrimerTable::new();
        for result in rdr.deserialize() {
            let entry: ForwardPrimerEntry = result?;
            table.insert(Primer {
                name: entry.name,
                sequence: entry.sequence,
                barcode: entry.barcode,
                linker: entry.linker.filter(|l| !l.is_empty()),
            })?;
        }
        Ok(table)
    }

    /// Read a reverse primer table (`Reverse_primer`, `ReversePrimer`,
    /// `Barcode_Reverse_Primer`).
    pub fn reverse_from_csv<P: AsRef<Path>>(
        filepath: P,
        delimiter: u8,
    ) -> Result<PrimerTable, CfxError> {
        let mut rdr = InputFile::new(filepath.as_ref()).csv_reader(delimiter)?;
        let mut table = PrimerTable::new();
        for result in rdr.deserialize() {
            let entry: ReversePrimerEntry = result?;
            table.insert(Primer {
                name: entry.name,
                sequence: entry.sequence,
                barcode: entry.barcode,
                linker: None,
            })?;
        }
        Ok(table)
    }
}

/// One row of a sample sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub forward_primer: String,
    pub reverse_primer: String,
    /// Metadata values, aligned with [`SampleSheet::metadata_columns`].
    pub metadata: Vec<String>,
}

/// Primer pairs and metadata per sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSheet {
    pub metadata_columns: Vec<String>,
    pub rows: Vec<SheetRow>,
}

impl SampleSheet {
    /// Read a sample sheet. Columns after the two primer columns are kept
    /// as metadata, up to and including the `Description` column.
    pub fn from_csv<P: AsRef<Path>>(filepath: P, delimiter: u8) -> Result<SampleSheet, CfxError> {
        let mut rdr = InputFile::new(filepath.as_ref()).csv_reader(delimiter)?;
        let headers = rdr.headers()?.clone();
        let fw_idx = column_index(&headers, "Forward_primer")?;
        let rv_idx = column_index(&headers, "Reverse_primer")?;

        let mut metadata_idx: Vec<usize> = Vec::new();
        for (i, h) in headers.iter().enumerate() {
            if i == fw_idx || i == rv_idx {
                continue;
            }
            metadata_idx.push(i);
            if h.trim().eq_ignore_ascii_case("description") {
                break;
            }
        }
        let metadata_columns = metadata_idx
            .iter()
            .map(|&i| headers[i].trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record: StringRecord = result?;
            let forward_primer = record.get(fw_idx).unwrap_or("").to_string();
            let reverse_primer = record.get(rv_idx).unwrap_or("").to_string();
            if forward_primer.is_empty() && reverse_primer.is_empty() {
                continue;
            }
            let metadata = metadata_idx
                .iter()
                .map(|&i| record.get(i).unwrap_or("").to_string())
                .collect();
            rows.push(SheetRow {
                forward_primer,
                reverse_primer,
                metadata,
            });
        }
        Ok(SampleSheet {
            metadata_columns,
            rows,
        })
    }
}

/// The barcode number of a primer name: the text after its first `y`,
/// so `515F_Golay001` gives `001`.
pub fn primer_number(name: &str) -> Result<&str, CfxError> {
    match name.split('y').nth(1) {
        Some(number) if !number.is_empty() => Ok(number),
        _ => Err(CfxError::ParseError(format!(
            "primer name '{}' has no barcode number",
            name
        ))),
    }
}

/// Forward barcode followed by the reverse complement of the reverse barcode.
pub fn barcode_sequence(forward_barcode: &str, reverse_barcode: &str) -> String {
    let rc = dna::revcomp(reverse_barcode.as_bytes());
    let mut combined = forward_barcode.to_string();
    combined.push_str(&String::from_utf8_lossy(&rc));
    combined
}

/// One line of a mapping file.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingRow {
    pub sample_id: String,
    pub barcode_sequence: String,
    pub linker_primer_sequence: String,
    pub reverse_primer_sequence: String,
    pub forward_barcode: String,
    pub reverse_barcode: String,
    pub forward_primer_name: String,
    pub reverse_primer_name: String,
    pub metadata: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingFile {
    pub metadata_columns: Vec<String>,
    pub rows: Vec<MappingRow>,
}

const MAPPING_COLUMNS: [&str; 8] = [
    "#SampleID",
    "BarcodeSequence",
    "LinkerPrimerSequence",
    "ReversePrimerSequence",
    "Forward_barcode",
    "Reverse_barcode",
    "ForwardPrimerName",
    "ReversePrimerName",
];

impl MappingFile {
    /// Join a sample sheet with the primer tables.
    pub fn build(
        sheet: &SampleSheet,
        forward: &PrimerTable,
        reverse: &PrimerTable,
        run_id: &str,
    ) -> Result<MappingFile, CfxError> {
        let rows = sheet
            .rows
            .iter()
            .map(|row| {
                let fw = forward.get(&row.forward_primer)?;
                let rv = reverse.get(&row.reverse_primer)?;
                Ok(MappingRow {
                    sample_id: format!(
                        "{}.{}.{}",
                        run_id,
                        primer_number(&fw.name)?,
                        primer_number(&rv.name)?
                    ),
                    barcode_sequence: barcode_sequence(&fw.barcode, &rv.barcode),
                    linker_primer_sequence: fw.linker.clone().unwrap_or_default(),
                    reverse_primer_sequence: rv.sequence.clone(),
                    forward_barcode: fw.barcode.clone(),
                    reverse_barcode: rv.barcode.clone(),
                    forward_primer_name: fw.name.clone(),
                    reverse_primer_name: rv.name.clone(),
                    metadata: row.metadata.clone(),
                })
            })
            .collect::<Result<Vec<_>, CfxError>>()?;
        info!(samples = rows.len(), run = run_id, "mapping file built");
        Ok(MappingFile {
            metadata_columns: sheet.metadata_columns.clone(),
            rows,
        })
    }

    /// Write the mapping file as TSV.
    pub fn write_tsv<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CfxError> {
        let mut header: Vec<&str> = MAPPING_COLUMNS.to_vec();
        header.extend(self.metadata_columns.iter().map(|s| s.as_str()));
        writeln!(writer, "{}", header.join("\t"))?;
        for row in self.rows.iter() {
            let mut fields: Vec<&str> = vec![
                &row.sample_id,
                &row.barcode_sequence,
                &row.linker_primer_sequence,
                &row.reverse_primer_sequence,
                &row.forward_barcode,
                &row.reverse_barcode,
                &row.forward_primer_name,
                &row.reverse_primer_name,
            ];
            fields.extend(row.metadata.iter().map(|s| s.as_str()));
            writeln!(writer, "{}", fields.join("\t"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> (PrimerTable, PrimerTable) {
        let fw = PrimerTable::forward_from_csv("tests/data/515F.csv", b';').unwrap();
        let rv = PrimerTable::reverse_from_csv("tests/data/926RBC.csv", b';').unwrap();
        (fw, rv)
    }

    #[test]
    fn test_primer_number() {
        assert_eq!(primer_number("515F_Golay001").unwrap(), "001");
        assert_eq!(primer_number("926RBC_Golay252").unwrap(), "252");
        assert!(primer_number("515F").is_err());
    }

    #[test]
    fn test_barcode_sequence() {
        assert_eq!(barcode_sequence("AAAC", "CTTCCAACTCAT"), "AAACATGAGTTGGAAG");
    }

    #[test]
    fn test_primer_tables() {
        let (fw, rv) = tables();
        assert_eq!(fw.primers.len(), 2);
        let p = fw.get("515F_Golay001").unwrap();
        assert_eq!(p.linker.as_deref(), Some("GTGYCAGCMGCCGCGGTAA"));
        assert_eq!(rv.get("926RBC_Golay002").unwrap().barcode, "CTTCCAACTCAT");
        assert!(matches!(fw.get("nope"), Err(CfxError::UnknownPrimer(_))));
    }

    #[test]
    fn test_invalid_barcode_rejected() {
        let mut table = PrimerTable::new();
        let err = table
            .insert(Primer {
                name: "X_Golay1".to_string(),
                sequence: "ACGT".to_string(),
                barcode: "ACXT".to_string(),
                linker: None,
            })
            .unwrap_err();
        assert!(matches!(err, CfxError::ParseError(_)));
    }

    #[test]
    fn test_build_mapping_file() {
        let (fw, rv) = tables();
        let sheet = SampleSheet::from_csv("tests/data/sample_sheet.csv", b';').unwrap();
        // columns after Description are dropped
        assert_eq!(
            sheet.metadata_columns,
            vec!["PurifMethod", "TargetAmpliconSize", "Description"]
        );
        let mapping = MappingFile::build(&sheet, &fw, &rv, "NIOZ313").unwrap();
        assert_eq!(mapping.rows.len(), 2);
        let first = &mapping.rows[0];
        assert_eq!(first.sample_id, "NIOZ313.001.002");
        assert_eq!(first.barcode_sequence, "GTATCGTCGTTGATGAGTTGGAAG");
        assert_eq!(first.metadata, vec!["GelQuant", "600bp400bp", "1A1P"]);

        let mut buf: Vec<u8> = Vec::new();
        mapping.write_tsv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("#SampleID\tBarcodeSequence\tLinkerPrimerSequence"));
        assert!(header.ends_with("\tDescription"));
    }

    #[test]
    fn test_unknown_primer_in_sheet() {
        let (fw, rv) = tables();
        let sheet = SampleSheet {
            metadata_columns: vec![],
            rows: vec![SheetRow {
                forward_primer: "515F_Golay999".to_string(),
                reverse_primer: "926RBC_Golay002".to_string(),
                metadata: vec![],
            }],
        };
        let err = MappingFile::build(&sheet, &fw, &rv, "NIOZ313").unwrap_err();
        assert!(matches!(err, CfxError::UnknownPrimer(ref p) if p == "515F_Golay999"));
    }
}
