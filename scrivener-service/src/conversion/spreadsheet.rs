//! Spreadsheet pre-processing before PDF rendering.
//!
//! Raw workbooks render badly: columns overflow pages, numbers show float
//! noise, and sheets lose their identity in the output. This pass rewrites the
//! workbook in-memory so the converter produces something a layout analyzer
//! can read: a title row per sheet, stringified cells, uniform font, column
//! widths sized to content, and landscape print settings that fit the page.

use umya_spreadsheet::helper::coordinate::string_from_column_index;
use umya_spreadsheet::{reader, writer};

use crate::error::ConversionError;

const FONT_NAME: &str = "Arial";
const FONT_SIZE: f64 = 10.0;
const MARGIN: f64 = 0.05;

/// Rewrite workbook bytes for print-friendly PDF rendering.
pub fn preprocess(content: &[u8]) -> Result<Vec<u8>, ConversionError> {
    let cursor = std::io::Cursor::new(content);
    let mut book = reader::xlsx::read_reader(cursor, true).map_err(|e| {
        ConversionError::Preprocess {
            message: format!("workbook read failed: {e}"),
        }
    })?;

    let sheet_count = book.get_sheet_count();
    for index in 0..sheet_count {
        let Some(sheet) = book.get_sheet_mut(&index) else {
            continue;
        };
        let title = sheet.get_name().to_string();

        let (max_column, max_row) = {
            let (c, r) = sheet.get_highest_column_and_row();
            (c, r)
        };

        // Title row above the data so each sheet is identifiable in the PDF.
        sheet.insert_new_row(&1, &1);
        sheet
            .get_cell_mut((1, 1))
            .set_value_string(format!("Sheet: {title}"));
        let max_row = max_row + 1;

        // Stringify cells: numbers to two decimals, everything in one font.
        let mut column_widths: Vec<usize> = vec![0; max_column as usize];
        for row in 1..=max_row {
            for column in 1..=max_column {
                let cell = sheet.get_cell_mut((column, row));
                let raw = cell.get_value().to_string();
                if raw.is_empty() {
                    continue;
                }
                let display = match raw.parse::<f64>() {
                    Ok(n) if n.fract() != 0.0 => format!("{n:.2}"),
                    _ => raw,
                };
                cell.set_value_string(&display);
                let style = cell.get_style_mut();
                let font = style.get_font_mut();
                font.set_name(FONT_NAME);
                font.set_size(FONT_SIZE);

                let width = &mut column_widths[(column - 1) as usize];
                *width = (*width).max(display.len());
            }
        }

        // Column widths proportional to the longest value in the column.
        for (i, width) in column_widths.iter().enumerate() {
            if *width == 0 {
                continue;
            }
            let letter = string_from_column_index(&((i as u32) + 1));
            sheet
                .get_column_dimension_mut(&letter)
                .set_width(*width as f64 * 1.2 + 3.0);
        }

        // Landscape, centered, tight margins; large sheets are scaled down
        // and fit to one page wide so no column is cut off mid-page.
        let page_setup = sheet.get_page_setup_mut();
        page_setup
            .set_orientation(umya_spreadsheet::OrientationValues::Landscape);
        if max_row > 20 || max_column > 10 {
            page_setup.set_scale(50);
            page_setup.set_fit_to_width(1);
            page_setup.set_fit_to_height(0);
        }

        let print_options = sheet.get_print_options_mut();
        print_options.set_horizontal_centered(true);
        print_options.set_vertical_centered(true);

        let margins = sheet.get_page_margins_mut();
        margins.set_left(MARGIN);
        margins.set_right(MARGIN);
        margins.set_top(MARGIN);
        margins.set_bottom(MARGIN);
    }

    let mut out = Vec::new();
    writer::xlsx::write_writer(&book, std::io::Cursor::new(&mut out)).map_err(|e| {
        ConversionError::Preprocess {
            message: format!("workbook write failed: {e}"),
        }
    })?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workbook() -> Vec<u8> {
        let mut book = umya_spreadsheet::new_file();
        let sheet = book.get_sheet_mut(&0).unwrap();
        sheet.get_cell_mut((1, 1)).set_value_string("Amount");
        sheet.get_cell_mut((1, 2)).set_value_number(12.3456);
        sheet.get_cell_mut((2, 2)).set_value_string("July consulting");

        let mut out = Vec::new();
        writer::xlsx::write_writer(&book, std::io::Cursor::new(&mut out)).unwrap();
        out
    }

    #[test]
    fn preprocess_inserts_title_row_and_rounds_numbers() {
        let processed = preprocess(&sample_workbook()).unwrap();

        let book =
            reader::xlsx::read_reader(std::io::Cursor::new(processed.as_slice()), true).unwrap();
        let sheet = book.get_sheet(&0).unwrap();

        let title = sheet.get_value((1, 1));
        assert!(title.starts_with("Sheet: "), "got title row {title:?}");

        // Original row 1 shifted down; the float got two decimals.
        assert_eq!(sheet.get_value((1, 2)), "Amount");
        assert_eq!(sheet.get_value((1, 3)), "12.35");
        assert_eq!(sheet.get_value((2, 3)), "July consulting");
    }

    #[test]
    fn large_sheets_are_fit_to_page_width() {
        let mut book = umya_spreadsheet::new_file();
        let sheet = book.get_sheet_mut(&0).unwrap();
        for column in 1..=12u32 {
            sheet.get_cell_mut((column, 1)).set_value_string("wide");
        }
        let mut raw = Vec::new();
        writer::xlsx::write_writer(&book, std::io::Cursor::new(&mut raw)).unwrap();

        let processed = preprocess(&raw).unwrap();
        let book =
            reader::xlsx::read_reader(std::io::Cursor::new(processed.as_slice()), true).unwrap();
        let setup = book.get_sheet(&0).unwrap().get_page_setup();
        assert_eq!(*setup.get_scale(), 50);
        assert_eq!(*setup.get_fit_to_width(), 1);
        assert_eq!(*setup.get_fit_to_height(), 0);
    }

    #[test]
    fn garbage_input_is_a_terminal_preprocess_error() {
        let result = preprocess(b"not a workbook");
        match result {
            Err(e) => assert!(!e.is_retryable()),
            Ok(_) => panic!("garbage bytes must not preprocess"),
        }
    }
}
