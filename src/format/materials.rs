//! Material table codec (`labels.chk` and the combined export)

use crate::error::{Result, VolError};
use crate::types::{IntensityRange, Material, MaterialTable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const MAX_MATERIALS: i32 = 256;
const MAX_NAME_LEN: u32 = 4096;

pub fn write_materials<W: Write>(writer: &mut W, table: &MaterialTable) -> Result<()> {
    writer.write_i32::<LittleEndian>(table.len() as i32)?;
    for material in table.iter() {
        let name = material.name.as_bytes();
        writer.write_u32::<LittleEndian>(name.len() as u32)?;
        writer.write_all(name)?;
        writer.write_u32::<LittleEndian>(material.color)?;
        writer.write_u8(material.range.min)?;
        writer.write_u8(material.range.max)?;
        writer.write_u8(material.is_exterior as u8)?;
        writer.write_u8(material.id)?;
    }
    Ok(())
}

pub fn read_materials<R: Read>(reader: &mut R) -> Result<MaterialTable> {
    let count = reader.read_i32::<LittleEndian>()?;
    if !(0..=MAX_MATERIALS).contains(&count) {
        return Err(VolError::corrupt(format!(
            "material count {} outside 0..={}",
            count, MAX_MATERIALS
        )));
    }
    let mut materials = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32::<LittleEndian>()?;
        if len > MAX_NAME_LEN {
            return Err(VolError::corrupt(format!("material name length {}", len)));
        }
        let mut name = vec![0u8; len as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|e| VolError::corrupt(format!("material name: {}", e)))?;
        let color = reader.read_u32::<LittleEndian>()?;
        let min = reader.read_u8()?;
        let max = reader.read_u8()?;
        let is_exterior = reader.read_u8()? != 0;
        let id = reader.read_u8()?;
        materials.push(Material {
            name,
            color,
            range: IntensityRange::new(min, max),
            is_exterior,
            id,
        });
    }
    MaterialTable::from_materials(materials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_table_roundtrip() {
        let mut table = MaterialTable::default();
        table
            .add(Material::new("Calcite", 0xFF3366CC, IntensityRange::new(120, 200), 4))
            .unwrap();
        table
            .add(Material::new("Pore ø", 0xFF000000, IntensityRange::new(0, 30), 1))
            .unwrap();

        let mut bytes = Vec::new();
        write_materials(&mut bytes, &table).unwrap();
        let decoded = read_materials(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_entry_layout() {
        let mut bytes = Vec::new();
        write_materials(&mut bytes, &MaterialTable::default()).unwrap();
        // count + (len + "Exterior" + color + min + max + exterior + id)
        assert_eq!(bytes.len(), 4 + 4 + 8 + 4 + 4);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(bytes[bytes.len() - 2], 1);
        assert_eq!(bytes[bytes.len() - 1], 0);
    }

    #[test]
    fn test_rejects_bad_count() {
        let bytes = (-1i32).to_le_bytes();
        assert!(read_materials(&mut Cursor::new(bytes)).is_err());
    }
}
